//! Persistent cache layer.
//!
//! Two payloads are stored: the raw submission snapshot and the validation
//! mapping derived from it. Every load checks version, time-to-live and
//! structure; a validation payload older than the submission snapshot is
//! stale regardless of its own age. Structurally broken payloads are deleted
//! and reported as absent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, MergeError};
use crate::model::RawSubmission;
use crate::results::ValidationCache;
use crate::traits::{CacheStore, FetchOutcome};

pub const SUBMISSIONS_KEY: &str = "submissions";
/// Version and timestamp of the submission snapshot, written alongside it.
pub const SUBMISSIONS_HEADER_KEY: &str = "submissions-header";
pub const VALIDATION_KEY: &str = "validation";

/// Expiry and versioning for cached payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Zero means payloads never expire by age.
    pub ttl: Duration,
    /// Payloads written under another version are ignored.
    pub version: String,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
            version: "1".to_string(),
        }
    }
}

/// The raw submissions of one fetch pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSnapshot {
    pub version: String,
    pub cached_at: DateTime<Utc>,
    pub count: usize,
    pub submissions: Vec<RawSubmission>,
    #[serde(default)]
    pub skipped: Vec<MergeError>,
}

/// Header fields shared by every cached payload.
pub trait CachePayload {
    fn version(&self) -> &str;
    fn cached_at(&self) -> DateTime<Utc>;
    /// Stored count against actual record count and similar invariants.
    fn check_structure(&self) -> Result<(), String>;
}

impl CachePayload for SubmissionSnapshot {
    fn version(&self) -> &str {
        &self.version
    }

    fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    fn check_structure(&self) -> Result<(), String> {
        if self.count != self.submissions.len() {
            return Err(format!(
                "stored count {} but {} submissions",
                self.count,
                self.submissions.len()
            ));
        }
        Ok(())
    }
}

impl CachePayload for ValidationCache {
    fn version(&self) -> &str {
        &self.version
    }

    fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    fn check_structure(&self) -> Result<(), String> {
        if self.count != self.entries.len() {
            return Err(format!(
                "stored count {} but {} entries",
                self.count,
                self.entries.len()
            ));
        }
        if let Some((key, entry)) = self.entries.iter().find(|(k, e)| **k != e.test_taker) {
            return Err(format!(
                "entry keyed {key} belongs to {}",
                entry.test_taker
            ));
        }
        if self.source_cached_at > self.cached_at {
            return Err("derived from a snapshot newer than itself".to_string());
        }
        Ok(())
    }
}

/// Only the snapshot header, for freshness checks without the records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: String,
    pub cached_at: DateTime<Utc>,
    pub count: usize,
}

impl From<&SubmissionSnapshot> for SnapshotHeader {
    fn from(snapshot: &SubmissionSnapshot) -> Self {
        Self {
            version: snapshot.version.clone(),
            cached_at: snapshot.cached_at,
            count: snapshot.count,
        }
    }
}

/// In-process cache backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Typed cache access over an injected [`CacheStore`].
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    policy: CachePolicy,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, policy: CachePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Serialize and store `payload` under `key`, replacing any previous value.
    pub async fn save<T: Serialize + Sync>(&self, key: &str, payload: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| CacheError::Backend(format!("failed to encode '{key}': {e}")))?;
        self.store
            .put(key, &bytes)
            .await
            .map_err(|e| CacheError::Backend(format!("{e:#}")))?;
        tracing::debug!(key, bytes = bytes.len(), "cache entry written");
        Ok(())
    }

    /// Load and validate the payload under `key`.
    ///
    /// Structurally invalid payloads are deleted; expired or foreign-version
    /// payloads are left in place. All of these load as `None`.
    pub async fn load<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + CachePayload + Send,
    {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, "cache read failed, treating as absent: {e:#}");
                return None;
            }
        };

        let payload: T = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                self.discard(CacheError::Structural {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
                .await;
                return None;
            }
        };
        if let Err(reason) = payload.check_structure() {
            self.discard(CacheError::Structural {
                key: key.to_string(),
                reason,
            })
            .await;
            return None;
        }
        if !self.is_valid(&payload, Utc::now()) {
            tracing::debug!(key, "cache entry expired or from another version");
            return None;
        }
        Some(payload)
    }

    /// Version and time-to-live check.
    pub fn is_valid<T: CachePayload>(&self, payload: &T, now: DateTime<Utc>) -> bool {
        if payload.version() != self.policy.version {
            return false;
        }
        if self.policy.ttl.is_zero() {
            return true;
        }
        let age = now.signed_duration_since(payload.cached_at());
        match age.to_std() {
            Ok(age) => age <= self.policy.ttl,
            // stamped in the future: clock moved backwards, keep it
            Err(_) => true,
        }
    }

    async fn discard(&self, err: CacheError) {
        tracing::warn!("{err}; discarding");
        if let CacheError::Structural { key, .. } = &err {
            let keys: &[&str] = if key == SUBMISSIONS_KEY {
                &[SUBMISSIONS_KEY, SUBMISSIONS_HEADER_KEY]
            } else {
                &[key.as_str()]
            };
            for key in keys {
                if let Err(e) = self.store.delete(key).await {
                    tracing::warn!(key = %key, "failed to delete broken cache entry: {e:#}");
                }
            }
        }
    }

    /// Snapshot a fetch outcome and persist it.
    pub async fn save_submissions(
        &self,
        outcome: FetchOutcome,
    ) -> Result<SubmissionSnapshot, CacheError> {
        let snapshot = SubmissionSnapshot {
            version: self.policy.version.clone(),
            cached_at: Utc::now(),
            count: outcome.submissions.len(),
            submissions: outcome.submissions,
            skipped: outcome.skipped,
        };
        self.save(SUBMISSIONS_KEY, &snapshot).await?;
        self.save(SUBMISSIONS_HEADER_KEY, &SnapshotHeader::from(&snapshot))
            .await?;
        tracing::info!(count = snapshot.count, "submission cache saved");
        Ok(snapshot)
    }

    pub async fn load_submissions(&self) -> Option<SubmissionSnapshot> {
        self.load(SUBMISSIONS_KEY).await
    }

    pub async fn save_validation(&self, cache: &ValidationCache) -> Result<(), CacheError> {
        self.save(VALIDATION_KEY, cache).await?;
        tracing::info!(count = cache.count, build_id = %cache.build_id, "validation cache saved");
        Ok(())
    }

    /// The validation mapping, provided it is valid and not older than the
    /// submission snapshot it should derive from.
    pub async fn load_validation(&self) -> Option<ValidationCache> {
        let cache: ValidationCache = self.load(VALIDATION_KEY).await?;
        let Some(source_at) = self.snapshot_cached_at().await else {
            tracing::debug!("no submission snapshot, validation cache is stale");
            return None;
        };
        if cache.cached_at < source_at || cache.source_cached_at < source_at {
            tracing::info!(
                validation_at = %cache.cached_at,
                submissions_at = %source_at,
                "validation cache predates submission cache"
            );
            return None;
        }
        Some(cache)
    }

    async fn snapshot_cached_at(&self) -> Option<DateTime<Utc>> {
        let bytes = self.store.get(SUBMISSIONS_HEADER_KEY).await.ok()??;
        let header: SnapshotHeader = serde_json::from_slice(&bytes).ok()?;
        (header.version == self.policy.version).then_some(header.cached_at)
    }

    /// Clear the submission snapshot and the validation mapping derived from it.
    pub async fn clear_submissions(&self) -> Result<(), CacheError> {
        self.delete(SUBMISSIONS_KEY).await?;
        self.delete(SUBMISSIONS_HEADER_KEY).await?;
        self.clear_validation().await
    }

    pub async fn clear_validation(&self) -> Result<(), CacheError> {
        self.delete(VALIDATION_KEY).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store
            .delete(key)
            .await
            .map_err(|e| CacheError::Backend(format!("{e:#}")))?;
        tracing::info!(key, "cache entry cleared");
        Ok(())
    }
}
