//! The `tallyset status` command.

use std::path::PathBuf;

use anyhow::Result;

use super::{open_cache, parse_ids, print_entries, print_footer};

pub async fn execute(ids: Vec<String>, json: bool, config_path: Option<PathBuf>) -> Result<()> {
    let (config, cache) = open_cache(config_path.as_deref())?;

    let Some(mut validation) = cache.load_validation().await else {
        println!("No valid validation cache. Run `tallyset sync` first.");
        return Ok(());
    };

    if !ids.is_empty() {
        let wanted = parse_ids(&ids, &config.aggregate.identity_prefix)?;
        validation = validation.restrict_to(&wanted);
        anyhow::ensure!(!validation.is_empty(), "no cached entries for the requested ids");
    }

    if json {
        let entries: Vec<_> = validation.entries.values().collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    print_entries(validation.entries.values());
    print_footer(&validation);
    Ok(())
}
