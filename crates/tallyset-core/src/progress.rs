//! Progress reporting and cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Which part of a rebuild a progress value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    FetchPrimary,
    FetchSecondary,
    Validate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::FetchPrimary => write!(f, "fetch primary"),
            Phase::FetchSecondary => write!(f, "fetch secondary"),
            Phase::Validate => write!(f, "validate"),
        }
    }
}

/// Progress callback. Called inline from the fetch and validate loops, so
/// implementations must return immediately.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, phase: Phase, percent: u8, message: &str);
}

/// No-op progress observer.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _: Phase, _: u8, _: &str) {}
}

/// A progress update forwarded over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
}

/// Forwards progress to an unbounded channel; sending never waits.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, phase: Phase, percent: u8, message: &str) {
        // receiver gone: nobody is watching any more
        let _ = self.tx.send(ProgressEvent {
            phase,
            percent,
            message: message.to_string(),
        });
    }
}

/// Per-phase tracker that only ever reports increasing percentages.
pub struct ProgressTracker {
    observer: Arc<dyn ProgressObserver>,
    phase: Phase,
    last: AtomicU8,
    started: AtomicBool,
}

impl ProgressTracker {
    pub fn new(observer: Arc<dyn ProgressObserver>, phase: Phase) -> Self {
        Self {
            observer,
            phase,
            last: AtomicU8::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Report `percent` (clamped to 100). Values not above the last reported
    /// one are dropped, except for the first report.
    pub fn report(&self, percent: u8, message: &str) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        let first = !self.started.swap(true, Ordering::SeqCst);
        if percent > previous || first {
            self.observer.on_progress(self.phase, percent.max(previous), message);
        }
    }

    /// Report `done` out of `total` items.
    pub fn report_ratio(&self, done: usize, total: usize, message: &str) {
        let percent = if total == 0 {
            100
        } else {
            ((done.min(total) * 100) / total) as u8
        };
        self.report(percent, message);
    }

    pub fn finish(&self, message: &str) {
        self.report(100, message);
    }

    pub fn percent(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Cooperative cancellation, checked between pages and between test-takers.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_never_reports_backwards() {
        let (observer, mut rx) = ChannelObserver::new();
        let tracker = ProgressTracker::new(Arc::new(observer), Phase::FetchPrimary);

        tracker.report(0, "start");
        tracker.report(40, "page 1");
        tracker.report(30, "late");
        tracker.report(40, "same");
        tracker.report_ratio(3, 4, "page 3");
        tracker.finish("done");
        tracker.report(120, "overflow");

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.percent);
        }
        assert_eq!(seen, vec![0, 40, 75, 100]);
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn ratio_of_empty_total_is_complete() {
        let tracker = ProgressTracker::new(Arc::new(NoopObserver), Phase::Validate);
        tracker.report_ratio(0, 0, "nothing to do");
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
