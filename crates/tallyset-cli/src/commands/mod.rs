pub mod check;
pub mod clear_cache;
pub mod lookup;
pub mod orphans;
pub mod questions;
pub mod status;
pub mod sync;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use comfy_table::{Cell, Table};

use tallyset_core::cache::CacheLayer;
use tallyset_core::model::TestTakerId;
use tallyset_core::progress::{Phase, ProgressObserver};
use tallyset_core::results::{SetState, ValidationCache, ValidationCacheEntry};
use tallyset_sources::config::{load_config_from, TallysetConfig};
use tallyset_store::FileStore;

/// Config plus the file-backed cache it points at.
pub(crate) fn open_cache(config_path: Option<&Path>) -> Result<(TallysetConfig, CacheLayer)> {
    let config = load_config_from(config_path)?;
    let store = FileStore::open(&config.cache.dir)?;
    let cache = CacheLayer::new(Arc::new(store), config.cache.policy());
    Ok((config, cache))
}

/// Normalize user-supplied ids with the configured prefix.
pub(crate) fn parse_ids(raw: &[String], prefix: &str) -> Result<BTreeSet<TestTakerId>> {
    raw.iter()
        .flat_map(|s| s.split(','))
        .map(|s| {
            TestTakerId::normalize(s, prefix)
                .ok_or_else(|| anyhow::anyhow!("invalid test-taker id: '{s}'"))
        })
        .collect()
}

/// Console progress reporter.
pub(crate) struct ConsoleProgress;

impl ProgressObserver for ConsoleProgress {
    fn on_progress(&self, phase: Phase, percent: u8, message: &str) {
        eprintln!("  [{phase}] {percent:>3}% {message}");
    }
}

pub(crate) fn print_entries<'a>(entries: impl IntoIterator<Item = &'a ValidationCacheEntry>) {
    let entries: Vec<_> = entries.into_iter().collect();
    let Some(first) = entries.first() else {
        println!("No test-takers.");
        return;
    };

    let mut header = vec!["Test-taker".to_string()];
    header.extend(first.sets.iter().map(|s| s.name.clone()));
    header.extend(["Completion".to_string(), "Flags".to_string()]);

    let mut table = Table::new();
    table.set_header(header);

    for entry in entries {
        let mut row = vec![Cell::new(entry.test_taker.as_str())];
        for set in &entry.sets {
            let marker = match set.status {
                SetState::Complete => "done",
                SetState::Incomplete => "open",
                SetState::NotStarted => "-",
            };
            row.push(Cell::new(format!(
                "{}/{} {marker}",
                set.tasks_complete, set.tasks_total
            )));
        }
        row.push(Cell::new(format!("{:.1}%", entry.completion_pct)));
        row.push(Cell::new(flags(entry)));
        table.add_row(row);
    }

    println!("{table}");
}

fn flags(entry: &ValidationCacheEntry) -> String {
    let mut out = Vec::new();
    if let Some(error) = &entry.error {
        out.push(format!("error: {error}"));
    }
    if !entry.flags.post_termination_answers.is_empty() {
        out.push(format!(
            "answers after termination: {}",
            entry.flags.post_termination_answers.join(", ")
        ));
    }
    if !entry.flags.termination_mismatches.is_empty() {
        out.push(format!(
            "termination mismatch: {}",
            entry.flags.termination_mismatches.join(", ")
        ));
    }
    if entry.has_orphaned_data {
        out.push("orphaned data".to_string());
    }
    out.join("; ")
}

pub(crate) fn print_footer(cache: &ValidationCache) {
    let complete = cache
        .entries
        .values()
        .filter(|e| e.is_complete())
        .count();
    println!(
        "\n{} test-takers, {complete} complete, {} failed, {} orphan identities, {} skipped records",
        cache.len(),
        cache.diagnostics.failed_test_takers,
        cache.orphans.len(),
        cache.diagnostics.skipped_records.len(),
    );
    println!(
        "Built {} from submissions cached {}",
        cache.cached_at.format("%Y-%m-%d %H:%M:%S UTC"),
        cache.source_cached_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );
}
