//! In-memory page source for tests and offline runs.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;

use tallyset_core::error::FetchError;
use tallyset_core::model::{RawSubmission, SourceTag};
use tallyset_core::traits::{Page, PageRequest, PageSource};

/// Serves a fixed submission list in pages, optionally failing first.
///
/// Queued failures are returned, one per call, before any page is served.
pub struct MockPageSource {
    tag: SourceTag,
    submissions: Vec<RawSubmission>,
    report_total: bool,
    failures: Mutex<VecDeque<FetchError>>,
    call_count: AtomicU32,
    requests: Mutex<Vec<PageRequest>>,
}

impl MockPageSource {
    pub fn new(tag: SourceTag, submissions: Vec<RawSubmission>) -> Self {
        Self {
            tag,
            submissions,
            report_total: false,
            failures: Mutex::new(VecDeque::new()),
            call_count: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load a JSON array of submissions. Each record's `source` is overridden
    /// by `tag`.
    pub fn from_json_file(tag: SourceTag, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read submissions: {}", path.display()))?;
        let mut submissions: Vec<RawSubmission> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse submissions: {}", path.display()))?;
        for submission in &mut submissions {
            submission.source = tag;
        }
        Ok(Self::new(tag, submissions))
    }

    /// Report the total record count on each page.
    pub fn with_total(mut self) -> Self {
        self.report_total = true;
        self
    }

    pub fn with_failures(self, failures: impl IntoIterator<Item = FetchError>) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(failures);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl PageSource for MockPageSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn source_tag(&self) -> SourceTag {
        self.tag
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(failure) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(failure);
        }

        let submissions = self
            .submissions
            .iter()
            .skip(request.offset)
            .take(request.limit)
            .cloned()
            .collect();
        Ok(Page {
            submissions,
            skipped: Vec::new(),
            total: self.report_total.then_some(self.submissions.len()),
        })
    }
}
