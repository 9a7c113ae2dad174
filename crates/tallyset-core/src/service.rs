//! Validation service: cache-first rebuild orchestration.
//!
//! Serves the persisted validation mapping while it is valid; otherwise
//! fetches (or reuses) the raw submissions, groups and evaluates them, and
//! persists the new mapping before returning it. Concurrent rebuilds for the
//! same test-taker set, and concurrent fetch passes, share one run.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::aggregate::{AggregatorConfig, SetAggregator};
use crate::cache::{CacheLayer, SubmissionSnapshot, SUBMISSIONS_KEY, VALIDATION_KEY};
use crate::catalogue::InstrumentCatalogue;
use crate::error::ServiceError;
use crate::flight::SingleFlight;
use crate::merge::CrossSourceMerger;
use crate::model::{TestTaker, TestTakerId};
use crate::progress::{CancellationFlag, NoopObserver, ProgressObserver};
use crate::results::{BuildDiagnostics, ValidationCache};
use crate::traits::{RuleEngine, SubmissionFeed};

struct ServiceInner {
    feed: Arc<dyn SubmissionFeed>,
    engine: Arc<dyn RuleEngine>,
    cache: CacheLayer,
    merger: CrossSourceMerger,
    aggregator: AggregatorConfig,
    observer: Arc<dyn ProgressObserver>,
    fetches: SingleFlight<Arc<SubmissionSnapshot>>,
}

/// Entry point for building and serving validation caches.
pub struct ValidationService {
    inner: Arc<ServiceInner>,
    rebuilds: SingleFlight<Arc<ValidationCache>>,
}

impl ValidationService {
    pub fn new(
        feed: Arc<dyn SubmissionFeed>,
        engine: Arc<dyn RuleEngine>,
        cache: CacheLayer,
        merger: CrossSourceMerger,
        aggregator: AggregatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                feed,
                engine,
                cache,
                merger,
                aggregator,
                observer: Arc::new(NoopObserver),
                fetches: SingleFlight::new(),
            }),
            rebuilds: SingleFlight::new(),
        }
    }

    /// Report fetch and validation progress to `observer`.
    ///
    /// Must be called before the service is shared.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.observer = observer;
        }
        self
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.inner.cache
    }

    /// Validation entries for `test_takers`.
    ///
    /// Without `force`, a valid persisted mapping restricted to the requested
    /// identities is returned when it is non-empty. With `force`, submissions
    /// are fetched again as well.
    pub async fn build_validation_cache(
        &self,
        test_takers: &[TestTaker],
        catalogue: Arc<InstrumentCatalogue>,
        force: bool,
        cancel: &CancellationFlag,
    ) -> Result<Arc<ValidationCache>, ServiceError> {
        let requested: BTreeSet<TestTakerId> = test_takers.iter().map(|t| t.id.clone()).collect();

        if !force {
            if let Some(cached) = self.inner.cache.load_validation().await {
                let restricted = cached.restrict_to(&requested);
                if !restricted.is_empty() {
                    tracing::info!(
                        entries = restricted.len(),
                        build_id = %restricted.build_id,
                        "serving validation cache"
                    );
                    return Ok(Arc::new(restricted));
                }
            }
        }

        let key = flight_key(&requested, force);
        let inner = Arc::clone(&self.inner);
        let takers = test_takers.to_vec();
        let cancel = cancel.clone();
        self.rebuilds
            .run(&key, move || async move {
                inner
                    .rebuild(takers, catalogue, force, cancel)
                    .await
                    .map(Arc::new)
            })
            .await
    }

    /// The raw submission snapshot, fetching only when no valid one is cached.
    pub async fn submissions(
        &self,
        force: bool,
        cancel: &CancellationFlag,
    ) -> Result<Arc<SubmissionSnapshot>, ServiceError> {
        self.inner.submissions(force, cancel).await
    }

    /// Drop the submission snapshot and everything derived from it.
    pub async fn clear_cache(&self) -> Result<(), ServiceError> {
        self.inner.cache.clear_submissions().await?;
        Ok(())
    }
}

impl ServiceInner {
    async fn submissions(
        self: &Arc<Self>,
        force: bool,
        cancel: &CancellationFlag,
    ) -> Result<Arc<SubmissionSnapshot>, ServiceError> {
        if !force {
            if let Some(snapshot) = self.cache.load_submissions().await {
                tracing::debug!(count = snapshot.count, "reusing cached submissions");
                return Ok(Arc::new(snapshot));
            }
        }

        let this = Arc::clone(self);
        let cancel = cancel.clone();
        self.fetches
            .run(SUBMISSIONS_KEY, move || async move {
                let outcome = this
                    .feed
                    .fetch_all(Arc::clone(&this.observer), &cancel)
                    .await?;
                let snapshot = this.cache.save_submissions(outcome).await?;
                Ok(Arc::new(snapshot))
            })
            .await
    }

    async fn rebuild(
        self: Arc<Self>,
        test_takers: Vec<TestTaker>,
        catalogue: Arc<InstrumentCatalogue>,
        force: bool,
        cancel: CancellationFlag,
    ) -> Result<ValidationCache, ServiceError> {
        tracing::info!(test_takers = test_takers.len(), force, "rebuilding validation cache");
        let snapshot = self.submissions(force, &cancel).await?;

        let grouping = self.merger.group(snapshot.submissions.iter());
        let aggregator = SetAggregator::new(
            Arc::clone(&self.engine),
            catalogue,
            self.aggregator.clone(),
        );
        let output = aggregator
            .aggregate(&test_takers, &grouping, Arc::clone(&self.observer), &cancel)
            .await?;

        let mut skipped_records = snapshot.skipped.clone();
        skipped_records.extend(grouping.skipped);

        let cache = ValidationCache {
            build_id: Uuid::new_v4(),
            version: self.cache.policy().version.clone(),
            cached_at: Utc::now(),
            source_cached_at: snapshot.cached_at,
            count: output.entries.len(),
            entries: output.entries,
            orphans: output.orphans,
            diagnostics: BuildDiagnostics {
                skipped_records,
                failed_test_takers: output.failed,
            },
        };
        self.cache.save_validation(&cache).await?;
        Ok(cache)
    }
}

/// Rebuilds for the same identities (and force flag) share one run.
fn flight_key(ids: &BTreeSet<TestTakerId>, force: bool) -> String {
    let mut hasher = DefaultHasher::new();
    ids.hash(&mut hasher);
    force.hash(&mut hasher);
    format!("{VALIDATION_KEY}:{:016x}", hasher.finish())
}
