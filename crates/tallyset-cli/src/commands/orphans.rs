//! The `tallyset orphans` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use super::open_cache;

pub async fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let (_config, cache) = open_cache(config_path.as_deref())?;

    let Some(validation) = cache.load_validation().await else {
        println!("No valid validation cache. Run `tallyset sync` first.");
        return Ok(());
    };

    if validation.orphans.is_empty() {
        println!("No orphaned secondary-source data.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Test-taker", "In roster", "Submissions", "Fields"]);
    for orphan in &validation.orphans {
        let in_roster = validation.entries.contains_key(&orphan.test_taker);
        table.add_row(vec![
            Cell::new(orphan.test_taker.as_str()),
            Cell::new(if in_roster { "yes" } else { "no" }),
            Cell::new(orphan.submission_ids.join(", ")),
            Cell::new(orphan.answers.len()),
        ]);
    }
    println!("{table}");
    println!("\n{} orphan identities", validation.orphans.len());
    Ok(())
}
