//! Error types shared across the tallyset crates.
//!
//! Fetch errors are classified here so the adaptive fetcher can decide
//! between shrinking the batch and aborting without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SourceTag;

/// Errors raised while pulling submissions from a remote back-end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The transport gave up waiting for the remote API.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A gateway or upstream server error (500/502/503/504).
    #[error("gateway error (HTTP {status})")]
    Gateway { status: u16 },

    /// The response body could not be decoded (truncated JSON, HTML error page).
    #[error("malformed response body: {0}")]
    MalformedBody(String),

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Invalid or revoked credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote API signalled rate limiting.
    #[error("rate limited by remote API")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Any other non-retryable API error.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// A server-side export job reported failure.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// The smallest allowed batch size still failed.
    #[error("exhausted floor batch size {batch_size} at offset {offset}: {last}")]
    ExhaustedFloor {
        offset: usize,
        batch_size: usize,
        last: Box<FetchError>,
    },

    /// The pass was cancelled between pages.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Returns `true` if the request may succeed when retried with a smaller batch.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_)
                | FetchError::Gateway { .. }
                | FetchError::MalformedBody(_)
                | FetchError::Network(_)
        )
    }

    /// Returns `true` if the whole fetch must be aborted.
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

/// A malformed source record. Skipped and logged; merging continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MergeError {
    #[error("submission {submission_id} has no value for identity field '{field}'")]
    MissingIdentity { submission_id: String, field: String },

    #[error("submission {submission_id}: answer to question {question_id} has no field name")]
    UnnamedField {
        submission_id: String,
        question_id: String,
    },

    #[error("malformed {origin} record: {reason}")]
    MalformedRecord { origin: SourceTag, reason: String },
}

/// A rule-engine failure isolated to one test-taker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rule engine failed for {test_taker}: {message}")]
    RuleEngine { test_taker: String, message: String },
}

/// Errors from the persistent cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Stored payload is undecodable, incomplete or miscounted.
    #[error("cache entry '{key}' is structurally invalid: {reason}")]
    Structural { key: String, reason: String },

    /// The storage backend failed.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the validation service.
///
/// `Clone` because results are shared between callers attached to the same
/// in-flight rebuild.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("validation rebuild cancelled")]
    Cancelled,
}
