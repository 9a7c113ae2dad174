//! Core trait definitions for remote sources, rule engines and cache storage.
//!
//! Concrete sources live in `tallyset-sources`, the file-system cache backend
//! in `tallyset-store`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, MergeError};
use crate::model::{CanonicalAnswerSet, RawSubmission, SourceTag};
use crate::progress::{CancellationFlag, ProgressObserver};
use crate::results::TaskVerdict;

// ---------------------------------------------------------------------------
// Paginated sources
// ---------------------------------------------------------------------------

/// Sort direction for paginated requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One page request against a remote submission API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
    pub order_by: String,
    pub direction: SortDirection,
}

/// One page of decoded submissions.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub submissions: Vec<RawSubmission>,
    /// Records on this page that could not be decoded.
    pub skipped: Vec<MergeError>,
    /// Total record count, when the API reports it.
    pub total: Option<usize>,
}

impl Page {
    /// Number of records the API returned, decodable or not.
    pub fn received(&self) -> usize {
        self.submissions.len() + self.skipped.len()
    }
}

/// A remote API that serves submissions in offset/limit pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Human-readable source name (e.g. "jotform").
    fn name(&self) -> &str;

    fn source_tag(&self) -> SourceTag;

    /// Fetch one page. Transport timeouts must surface as a transient error.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError>;
}

// ---------------------------------------------------------------------------
// Whole-dataset feed
// ---------------------------------------------------------------------------

/// Everything one fetch pass produced.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub submissions: Vec<RawSubmission>,
    pub skipped: Vec<MergeError>,
}

impl FetchOutcome {
    pub fn extend(&mut self, other: FetchOutcome) {
        self.submissions.extend(other.submissions);
        self.skipped.extend(other.skipped);
    }
}

/// Produces the full raw submission set across all configured back-ends.
#[async_trait]
pub trait SubmissionFeed: Send + Sync {
    async fn fetch_all(
        &self,
        observer: Arc<dyn ProgressObserver>,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError>;
}

// ---------------------------------------------------------------------------
// Rule engine
// ---------------------------------------------------------------------------

/// Per-instrument scoring and termination, consumed as a black box.
///
/// Implementations must be idempotent and free of side effects.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    fn name(&self) -> &str;

    /// One verdict per instrument, keyed by instrument id.
    async fn validate_all_tasks(
        &self,
        answers: &CanonicalAnswerSet,
    ) -> anyhow::Result<HashMap<String, TaskVerdict>>;
}

// ---------------------------------------------------------------------------
// Cache storage
// ---------------------------------------------------------------------------

/// Durable key/value storage behind the cache layer.
///
/// `put` must replace the previous value atomically.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}
