//! The `tallyset sync` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use tallyset_core::catalogue::parse_catalogue;
use tallyset_core::engine::CatalogueRuleEngine;
use tallyset_core::merge::{CrossSourceMerger, SecondaryFieldMap};
use tallyset_core::model::Roster;
use tallyset_core::progress::CancellationFlag;
use tallyset_core::service::ValidationService;
use tallyset_sources::create_feed;

use super::{open_cache, parse_ids, print_entries, print_footer, ConsoleProgress};

pub async fn execute(force: bool, ids: Vec<String>, config_path: Option<PathBuf>) -> Result<()> {
    let (config, cache) = open_cache(config_path.as_deref())?;
    let identity = config.aggregate.identity();

    let catalogue = Arc::new(parse_catalogue(&config.files.catalogue)?);
    let field_map = SecondaryFieldMap::load(&config.files.field_map)?;
    for warning in field_map.validate() {
        eprintln!("Warning: {warning}");
    }
    let roster = Roster::load_json(&config.files.roster, &identity.prefix)?;
    anyhow::ensure!(
        !roster.is_empty(),
        "roster {} has no test-takers",
        config.files.roster.display()
    );

    let mut takers = roster.test_takers.clone();
    if !ids.is_empty() {
        let wanted = parse_ids(&ids, &identity.prefix)?;
        if let Some(missing) = wanted.iter().find(|id| roster.get(id).is_none()) {
            anyhow::bail!("unknown test-taker: {missing}");
        }
        takers.retain(|t| wanted.contains(&t.id));
    }

    let feed = create_feed(&config).context("failed to set up submission sources")?;
    let service = ValidationService::new(
        Arc::new(feed),
        Arc::new(CatalogueRuleEngine::new(Arc::clone(&catalogue))),
        cache,
        CrossSourceMerger::new(&field_map, identity),
        config.aggregate.aggregator(),
    )
    .with_observer(Arc::new(ConsoleProgress));

    let cancel = CancellationFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping after the current request...");
            on_interrupt.cancel();
        }
    });

    eprintln!(
        "Syncing {} test-takers{}",
        takers.len(),
        if force { " (forced refetch)" } else { "" }
    );
    let result = service
        .build_validation_cache(&takers, catalogue, force, &cancel)
        .await?;

    print_entries(result.entries.values());
    print_footer(&result);
    Ok(())
}
