//! The `tallyset check` command.

use std::path::PathBuf;

use anyhow::Result;

use tallyset_core::catalogue::{parse_catalogue, validate_catalogue};
use tallyset_core::merge::SecondaryFieldMap;
use tallyset_core::model::Roster;
use tallyset_sources::config::load_config_from;

pub fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let mut total_warnings = 0;

    let catalogue = parse_catalogue(&config.files.catalogue)?;
    println!(
        "Catalogue: {} sets, {} instruments",
        catalogue.sets.len(),
        catalogue.instruments.len()
    );
    for w in validate_catalogue(&catalogue) {
        let prefix = w
            .subject
            .as_ref()
            .map(|id| format!("  [{id}]"))
            .unwrap_or_else(|| "  ".to_string());
        println!("{prefix} WARNING: {}", w.message);
        total_warnings += 1;
    }

    let field_map = SecondaryFieldMap::load(&config.files.field_map)?;
    println!("Field map: {} fields", field_map.fields.len());
    for warning in field_map.validate() {
        println!("   WARNING: {warning}");
        total_warnings += 1;
    }
    if !field_map.fields.contains_key(&config.aggregate.identity_field) {
        println!(
            "   WARNING: identity field '{}' has no secondary-source mapping",
            config.aggregate.identity_field
        );
        total_warnings += 1;
    }

    let roster = Roster::load_json(&config.files.roster, &config.aggregate.identity_prefix)?;
    let unknown_gender = roster.test_takers.iter().filter(|t| t.gender.is_none()).count();
    println!("Roster: {} test-takers", roster.len());
    if unknown_gender > 0 {
        println!(
            "   WARNING: {unknown_gender} test-taker(s) without a gender; gender-conditional instruments will not apply"
        );
        total_warnings += 1;
    }

    if total_warnings == 0 {
        println!("All files valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
