//! The `tallyset clear-cache` command.

use std::path::PathBuf;

use anyhow::Result;

use super::open_cache;

pub async fn execute(validation_only: bool, config_path: Option<PathBuf>) -> Result<()> {
    let (config, cache) = open_cache(config_path.as_deref())?;

    if validation_only {
        cache.clear_validation().await?;
        println!("Cleared validation cache in {}", config.cache.dir.display());
    } else {
        cache.clear_submissions().await?;
        println!(
            "Cleared submission and validation caches in {}",
            config.cache.dir.display()
        );
    }
    Ok(())
}
