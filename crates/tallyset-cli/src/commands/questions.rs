//! The `tallyset questions` command.

use std::path::PathBuf;

use anyhow::Result;

use tallyset_sources::config::{create_jotform_client, load_config_from};
use tallyset_sources::jotform::write_question_map;

pub async fn execute(out: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let client = create_jotform_client(&config)?;

    let map = client.fetch_questions().await?;
    let path = out.unwrap_or(config.files.question_map);
    write_question_map(&path, &map)?;
    println!(
        "Wrote {} JotForm question mappings to {}",
        map.len(),
        path.display()
    );

    let identity_field = &config.aggregate.identity_field;
    if !map.contains_key(identity_field) {
        println!("   WARNING: identity field '{identity_field}' is not a question of this form");
    }
    Ok(())
}
