//! Combined primary + secondary submission feed.

use std::sync::Arc;

use async_trait::async_trait;

use tallyset_core::error::FetchError;
use tallyset_core::progress::{CancellationFlag, ProgressObserver};
use tallyset_core::traits::{FetchOutcome, SubmissionFeed};

/// Fetches the primary source, then the secondary one if configured.
///
/// Each back-end reports progress under its own phase. A failure in either
/// fails the whole pass.
pub struct DualSourceFeed {
    primary: Arc<dyn SubmissionFeed>,
    secondary: Option<Arc<dyn SubmissionFeed>>,
}

impl DualSourceFeed {
    pub fn new(primary: Arc<dyn SubmissionFeed>, secondary: Option<Arc<dyn SubmissionFeed>>) -> Self {
        Self { primary, secondary }
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

#[async_trait]
impl SubmissionFeed for DualSourceFeed {
    async fn fetch_all(
        &self,
        observer: Arc<dyn ProgressObserver>,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError> {
        let mut outcome = self.primary.fetch_all(Arc::clone(&observer), cancel).await?;
        let primary_count = outcome.submissions.len();

        if let Some(secondary) = &self.secondary {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            outcome.extend(secondary.fetch_all(observer, cancel).await?);
        }

        tracing::info!(
            primary = primary_count,
            secondary = outcome.submissions.len() - primary_count,
            skipped = outcome.skipped.len(),
            "submission fetch complete"
        );
        Ok(outcome)
    }
}
