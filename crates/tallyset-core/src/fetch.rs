//! Adaptive paginated fetching.
//!
//! Pages are pulled sequentially. A transient failure shrinks the batch size
//! down a configured ladder and retries the same offset; enough consecutive
//! successes at a reduced size climb back up one rung.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};

use crate::error::FetchError;
use crate::model::SourceTag;
use crate::progress::{CancellationFlag, Phase, ProgressObserver, ProgressTracker};
use crate::traits::{FetchOutcome, Page, PageRequest, PageSource, SortDirection, SubmissionFeed};

/// Progress never exceeds this while the total record count is unknown.
const UNKNOWN_TOTAL_CEILING: usize = 95;

/// Batch sizing and pacing for one paginated source.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Page size used while the source is healthy.
    pub baseline: usize,
    /// Multipliers applied to `baseline`, starting at 1.0 and strictly decreasing.
    pub reductions: Vec<f64>,
    /// Smallest batch size ever requested.
    pub floor: usize,
    /// Consecutive successes needed to climb back one rung.
    pub recovery_successes: u32,
    /// Pause between successful pages.
    pub page_delay: Duration,
    /// Pause before retrying a failed page.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            baseline: 100,
            reductions: vec![1.0, 0.5, 0.3, 0.2, 0.1],
            floor: 10,
            recovery_successes: 2,
            page_delay: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.baseline == 0 {
            bail!("baseline batch size must be positive");
        }
        if self.floor == 0 {
            bail!("floor batch size must be positive");
        }
        let Some(first) = self.reductions.first() else {
            bail!("reduction ladder must not be empty");
        };
        if (*first - 1.0).abs() > f64::EPSILON {
            bail!("reduction ladder must start at 1.0, got {first}");
        }
        for pair in self.reductions.windows(2) {
            if pair[1] >= pair[0] {
                bail!(
                    "reduction ladder must be strictly decreasing ({} then {})",
                    pair[0],
                    pair[1]
                );
            }
        }
        if let Some(bad) = self.reductions.iter().find(|f| **f <= 0.0 || **f > 1.0) {
            bail!("reduction factor {bad} is outside (0, 1]");
        }
        Ok(())
    }

    /// Concrete batch sizes for each rung, clamped to `[floor, baseline]`.
    /// Rungs that round to the same size collapse into one.
    pub fn batch_sizes(&self) -> Vec<usize> {
        let baseline = self.baseline.max(1);
        let floor = self.floor.clamp(1, baseline);
        let mut sizes: Vec<usize> = self
            .reductions
            .iter()
            .map(|f| ((baseline as f64 * f).ceil() as usize).clamp(floor, baseline))
            .collect();
        if sizes.is_empty() {
            sizes.push(baseline);
        }
        sizes.dedup();
        sizes
    }
}

/// Where the fetcher currently sits on the reduction ladder.
#[derive(Debug, Clone)]
pub struct BatchLadder {
    sizes: Vec<usize>,
    rung: usize,
    successes: u32,
    recovery: u32,
}

impl BatchLadder {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            sizes: policy.batch_sizes(),
            rung: 0,
            successes: 0,
            recovery: policy.recovery_successes.max(1),
        }
    }

    pub fn current(&self) -> usize {
        self.sizes[self.rung]
    }

    pub fn rung(&self) -> usize {
        self.rung
    }

    /// Record a successful page. Returns the new size if it climbed a rung.
    pub fn on_success(&mut self) -> Option<usize> {
        if self.rung == 0 {
            return None;
        }
        self.successes += 1;
        if self.successes >= self.recovery {
            self.rung -= 1;
            self.successes = 0;
            Some(self.current())
        } else {
            None
        }
    }

    /// Record a transient failure. Returns the next smaller size, or `None`
    /// when already at the floor.
    pub fn on_transient_failure(&mut self) -> Option<usize> {
        self.successes = 0;
        if self.rung + 1 < self.sizes.len() {
            self.rung += 1;
            Some(self.current())
        } else {
            None
        }
    }
}

struct FetchState {
    offset: usize,
    pages: usize,
    ladder: BatchLadder,
    pause_first: bool,
    done: bool,
}

/// Pulls every page from a [`PageSource`] with adaptive batch sizing.
pub struct AdaptiveFetcher<S> {
    source: Arc<S>,
    policy: RetryPolicy,
    order_by: String,
}

impl<S: PageSource> AdaptiveFetcher<S> {
    pub fn new(source: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            order_by: "created_at".to_string(),
        }
    }

    pub fn with_order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = field.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Lazy stream of pages in ascending order. Each call starts again from
    /// offset 0; nothing is requested until the stream is polled.
    pub fn pages<'a>(
        &'a self,
        progress: &'a ProgressTracker,
        cancel: &'a CancellationFlag,
    ) -> impl Stream<Item = Result<Page, FetchError>> + Send + 'a {
        let state = FetchState {
            offset: 0,
            pages: 0,
            ladder: BatchLadder::new(&self.policy),
            pause_first: false,
            done: false,
        };
        stream::try_unfold(state, move |state| self.next_page(state, progress, cancel))
    }

    async fn next_page(
        &self,
        mut state: FetchState,
        progress: &ProgressTracker,
        cancel: &CancellationFlag,
    ) -> Result<Option<(Page, FetchState)>, FetchError> {
        if state.done {
            return Ok(None);
        }
        if state.pause_first && !self.policy.page_delay.is_zero() {
            tokio::time::sleep(self.policy.page_delay).await;
        }
        let source = self.source.name().to_string();

        loop {
            if cancel.is_cancelled() {
                tracing::info!(source = %source, offset = state.offset, "fetch cancelled");
                return Err(FetchError::Cancelled);
            }

            let limit = state.ladder.current();
            let request = PageRequest {
                offset: state.offset,
                limit,
                order_by: self.order_by.clone(),
                direction: SortDirection::Asc,
            };

            match self.source.fetch_page(&request).await {
                Ok(page) => {
                    let received = page.received();
                    state.offset += received;
                    state.pages += 1;
                    if let Some(size) = state.ladder.on_success() {
                        tracing::info!(source = %source, batch_size = size, "batch size restored");
                    }
                    state.done = received < limit;
                    state.pause_first = !state.done;

                    let message = format!("{} records from {source}", state.offset);
                    if state.done {
                        progress.finish(&message);
                    } else {
                        progress.report(creep_percent(state.offset, state.pages, page.total), &message);
                    }
                    tracing::debug!(
                        source = %source,
                        offset = request.offset,
                        limit,
                        received,
                        "fetched page"
                    );
                    return Ok(Some((page, state)));
                }
                Err(e) if e.is_transient() => match state.ladder.on_transient_failure() {
                    Some(size) => {
                        tracing::warn!(
                            source = %source,
                            offset = state.offset,
                            failed_size = limit,
                            next_size = size,
                            "transient failure, reducing batch size: {e}"
                        );
                        if !self.policy.retry_delay.is_zero() {
                            tokio::time::sleep(self.policy.retry_delay).await;
                        }
                    }
                    None => {
                        tracing::error!(
                            source = %source,
                            offset = state.offset,
                            batch_size = limit,
                            "transient failure at floor batch size: {e}"
                        );
                        return Err(FetchError::ExhaustedFloor {
                            offset: state.offset,
                            batch_size: limit,
                            last: Box::new(e),
                        });
                    }
                },
                Err(e) => {
                    tracing::error!(source = %source, offset = state.offset, "terminal fetch error: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Drain [`pages`](Self::pages) into one outcome.
    pub async fn collect(
        &self,
        progress: &ProgressTracker,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError> {
        let mut outcome = FetchOutcome::default();
        let mut pages = std::pin::pin!(self.pages(progress, cancel));
        while let Some(page) = pages.try_next().await? {
            outcome.submissions.extend(page.submissions);
            outcome.skipped.extend(page.skipped);
        }
        tracing::info!(
            source = self.source.name(),
            records = outcome.submissions.len(),
            skipped = outcome.skipped.len(),
            "fetch complete"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl<S: PageSource + 'static> SubmissionFeed for AdaptiveFetcher<S> {
    async fn fetch_all(
        &self,
        observer: Arc<dyn ProgressObserver>,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError> {
        let phase = match self.source.source_tag() {
            SourceTag::Primary => Phase::FetchPrimary,
            SourceTag::Secondary => Phase::FetchSecondary,
        };
        let tracker = ProgressTracker::new(observer, phase);
        self.collect(&tracker, cancel).await
    }
}

fn creep_percent(fetched: usize, pages: usize, total: Option<usize>) -> u8 {
    match total {
        Some(total) if total > 0 => ((fetched.min(total) * 100) / total).min(99) as u8,
        _ => (UNKNOWN_TOTAL_CEILING - UNKNOWN_TOTAL_CEILING / (pages + 1)) as u8,
    }
}
