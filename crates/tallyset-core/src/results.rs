//! Result types: rule-engine verdicts, per-set completion status and the
//! cached validation record exposed to the presentation layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MergeError;
use crate::model::{CanonicalAnswerSet, TestTakerId};

/// Per-question outcome as reported by the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionVerdict {
    pub id: String,
    #[serde(default)]
    pub answer: Option<String>,
    /// `None` for questions without a scoring key.
    #[serde(default)]
    pub correct: Option<bool>,
}

/// Disagreement between a termination flag recorded on the form and the one
/// calculated from the answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationMismatch {
    pub recorded: bool,
    pub calculated: bool,
}

/// The rule engine's result for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskVerdict {
    pub instrument_id: String,
    pub total_questions: usize,
    pub answered_questions: usize,
    pub terminated: bool,
    /// Zero-based index of the question at which the instrument terminated.
    #[serde(default)]
    pub termination_index: Option<usize>,
    /// Answers exist after the termination point.
    #[serde(default)]
    pub post_termination_answers: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub questions: Vec<QuestionVerdict>,
    /// Only reported by instrument families that record termination on the form.
    #[serde(default)]
    pub termination_mismatch: Option<TerminationMismatch>,
}

/// Completion state of one instrument for one test-taker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    NotStarted,
    InProgress,
    Complete,
}

/// Completion state of one assessment set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetState {
    NotStarted,
    Incomplete,
    Complete,
}

impl fmt::Display for SetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetState::NotStarted => write!(f, "not started"),
            SetState::Incomplete => write!(f, "incomplete"),
            SetState::Complete => write!(f, "complete"),
        }
    }
}

/// Dashboard row for one applicable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub instrument_id: String,
    pub name: String,
    pub state: TaskState,
    pub answered: usize,
    pub total: usize,
    pub terminated: bool,
    pub timed_out: bool,
    pub post_termination_answers: bool,
}

/// Completion status of one of the four assessment sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStatus {
    pub set_id: String,
    pub name: String,
    pub status: SetState,
    pub tasks_complete: usize,
    pub tasks_total: usize,
    pub tasks: Vec<TaskSummary>,
}

/// Instruments carrying a termination-related flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSummary {
    #[serde(default)]
    pub terminated: Vec<String>,
    #[serde(default)]
    pub timed_out: Vec<String>,
    #[serde(default)]
    pub post_termination_answers: Vec<String>,
    #[serde(default)]
    pub termination_mismatches: Vec<String>,
}

impl FlagSummary {
    /// Flags that should be surfaced to a reviewer.
    pub fn needs_attention(&self) -> bool {
        !self.post_termination_answers.is_empty() || !self.termination_mismatches.is_empty()
    }
}

/// The cached validation record for one test-taker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCacheEntry {
    pub test_taker: TestTakerId,
    pub answers: CanonicalAnswerSet,
    /// Verdicts for applicable instruments only.
    pub verdicts: BTreeMap<String, TaskVerdict>,
    pub sets: Vec<SetStatus>,
    /// Complete over applicable instruments, 0.0–100.0.
    pub completion_pct: f64,
    #[serde(default)]
    pub flags: FlagSummary,
    /// Secondary-source data exists for this identity but was excluded.
    #[serde(default)]
    pub has_orphaned_data: bool,
    /// Set when the rule engine failed for this test-taker.
    #[serde(default)]
    pub error: Option<String>,
}

impl ValidationCacheEntry {
    pub fn set(&self, set_id: &str) -> Option<&SetStatus> {
        self.sets.iter().find(|s| s.set_id == set_id)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Every set with applicable instruments is complete. Sets with nothing
    /// applicable are ignored; an entry with no applicable work at all is
    /// not complete.
    pub fn is_complete(&self) -> bool {
        let mut applicable = self.sets.iter().filter(|s| s.tasks_total > 0).peekable();
        !self.is_error()
            && applicable.peek().is_some()
            && applicable.all(|s| s.status == SetState::Complete)
    }
}

/// Secondary-source data whose identity has no primary-source submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub test_taker: TestTakerId,
    pub submission_ids: Vec<String>,
    pub answers: CanonicalAnswerSet,
}

/// Non-fatal problems met while building a validation cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDiagnostics {
    #[serde(default)]
    pub skipped_records: Vec<MergeError>,
    #[serde(default)]
    pub failed_test_takers: usize,
}

/// The full validation mapping, persisted wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCache {
    pub build_id: Uuid,
    pub version: String,
    pub cached_at: DateTime<Utc>,
    /// Timestamp of the submission cache this mapping was derived from.
    pub source_cached_at: DateTime<Utc>,
    /// Stored record count, checked against `entries` on load.
    pub count: usize,
    pub entries: BTreeMap<TestTakerId, ValidationCacheEntry>,
    #[serde(default)]
    pub orphans: Vec<OrphanRecord>,
    #[serde(default)]
    pub diagnostics: BuildDiagnostics,
}

impl ValidationCache {
    pub fn get(&self, id: &TestTakerId) -> Option<&ValidationCacheEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy holding only the requested identities.
    pub fn restrict_to(&self, ids: &BTreeSet<TestTakerId>) -> ValidationCache {
        let entries: BTreeMap<_, _> = self
            .entries
            .iter()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        let orphans = self
            .orphans
            .iter()
            .filter(|o| ids.contains(&o.test_taker))
            .cloned()
            .collect();
        ValidationCache {
            build_id: self.build_id,
            version: self.version.clone(),
            cached_at: self.cached_at,
            source_cached_at: self.source_cached_at,
            count: entries.len(),
            entries,
            orphans,
            diagnostics: self.diagnostics.clone(),
        }
    }
}
