//! tallyset-store: File-system cache storage.
//!
//! One JSON document per cache key inside a cache directory. Writes go to a
//! temporary file in the same directory and are renamed into place, so a
//! reader never sees a half-written entry.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;

use tallyset_core::traits::CacheStore;

const ENTRY_EXTENSION: &str = "json";

/// Durable [`CacheStore`] backed by a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

/// Size and age of one stored entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: String,
    pub bytes: u64,
    pub modified: Option<std::time::SystemTime>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        anyhow::ensure!(valid, "invalid cache key '{key}'");
        Ok(self.dir.join(format!("{key}.{ENTRY_EXTENSION}")))
    }

    /// Entries currently on disk, sorted by key.
    pub async fn entries(&self) -> Result<Vec<EntryInfo>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || list_entries(&dir))
            .await
            .context("cache listing task failed")?
    }
}

fn list_entries(dir: &Path) -> Result<Vec<EntryInfo>> {
    let mut entries = Vec::new();
    let read = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list cache directory: {}", dir.display()))?;
    for item in read {
        let item = item?;
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let meta = item.metadata()?;
        entries.push(EntryInfo {
            key: key.to_string(),
            bytes: meta.len(),
            modified: meta.modified().ok(),
        });
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

fn write_atomic(dir: &Path, target: &Path, value: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(value).context("failed to write cache entry")?;
    tmp.as_file().sync_all().context("failed to flush cache entry")?;
    tmp.persist(target)
        .with_context(|| format!("failed to replace {}", target.display()))?;
    Ok(())
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.entry_path(key)?;
        let dir = self.dir.clone();
        let value = value.to_vec();
        let bytes = value.len();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &value))
            .await
            .context("cache write task failed")??;
        tracing::debug!(key, bytes, "cache file written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}
