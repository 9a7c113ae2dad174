//! Per-test-taker evaluation and set-level roll-up.
//!
//! Merges each test-taker's grouped submissions, hands the canonical answers to
//! the rule engine, and folds the verdicts into completion status for the four
//! assessment sets. Evaluation runs concurrently under a semaphore; results and
//! progress are collected in a single consumer loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::catalogue::{AssessmentSet, InstrumentCatalogue};
use crate::error::{ServiceError, ValidationError};
use crate::merge::{merge_resolved, Grouping, ResolvedSubmission};
use crate::model::{CanonicalAnswerSet, TestTaker, TestTakerId};
use crate::progress::{CancellationFlag, Phase, ProgressObserver, ProgressTracker};
use crate::results::{
    FlagSummary, OrphanRecord, SetState, SetStatus, TaskState, TaskSummary, TaskVerdict,
    ValidationCacheEntry,
};
use crate::traits::RuleEngine;

/// Configuration for the set aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Maximum concurrent rule-engine evaluations.
    pub parallelism: usize,
    /// Merge secondary-only data into entries instead of just flagging it.
    pub include_orphans: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            include_orphans: false,
        }
    }
}

/// Everything one aggregation pass produced.
#[derive(Debug, Clone, Default)]
pub struct AggregateOutput {
    pub entries: BTreeMap<TestTakerId, ValidationCacheEntry>,
    pub orphans: Vec<OrphanRecord>,
    /// Test-takers whose evaluation failed and carry an error entry.
    pub failed: usize,
}

/// Drives the rule engine per test-taker and rolls verdicts up into sets.
pub struct SetAggregator {
    engine: Arc<dyn RuleEngine>,
    catalogue: Arc<InstrumentCatalogue>,
    config: AggregatorConfig,
}

impl SetAggregator {
    pub fn new(
        engine: Arc<dyn RuleEngine>,
        catalogue: Arc<InstrumentCatalogue>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            engine,
            catalogue,
            config,
        }
    }

    pub fn catalogue(&self) -> &InstrumentCatalogue {
        &self.catalogue
    }

    /// Evaluate every requested test-taker.
    ///
    /// Each test-taker receives an entry, including those without submissions.
    /// A rule-engine failure becomes an error entry for that identity only.
    pub async fn aggregate(
        &self,
        test_takers: &[TestTaker],
        grouping: &Grouping,
        observer: Arc<dyn ProgressObserver>,
        cancel: &CancellationFlag,
    ) -> Result<AggregateOutput, ServiceError> {
        let progress = ProgressTracker::new(observer, Phase::Validate);
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let total = test_takers.len();
        progress.report(0, &format!("validating {total} test-takers"));

        let mut futures = FuturesUnordered::new();
        for test_taker in test_takers {
            let mut submissions: Vec<ResolvedSubmission> = grouping
                .groups
                .get(&test_taker.id)
                .cloned()
                .unwrap_or_default();
            let orphaned = grouping.orphans.get(&test_taker.id);
            if self.config.include_orphans {
                if let Some(extra) = orphaned {
                    submissions.extend(extra.iter().cloned());
                }
            }
            let has_orphaned_data = orphaned.is_some();

            let engine = Arc::clone(&self.engine);
            let catalogue = Arc::clone(&self.catalogue);
            let semaphore = Arc::clone(&semaphore);
            let test_taker = test_taker.clone();
            let cancel = cancel.clone();

            futures.push(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let answers = merge_resolved(&submissions);
                let entry = match engine.validate_all_tasks(&answers).await {
                    Ok(verdicts) => {
                        build_entry(&catalogue, &test_taker, answers, &verdicts, has_orphaned_data)
                    }
                    Err(e) => {
                        let err = ValidationError::RuleEngine {
                            test_taker: test_taker.id.to_string(),
                            message: format!("{e:#}"),
                        };
                        tracing::error!("{err}");
                        let mut entry = build_entry(
                            &catalogue,
                            &test_taker,
                            answers,
                            &HashMap::new(),
                            has_orphaned_data,
                        );
                        entry.error = Some(err.to_string());
                        entry
                    }
                };
                Some(entry)
            });
        }

        let mut output = AggregateOutput::default();
        let mut done = 0usize;
        while let Some(entry) = futures.next().await {
            if cancel.is_cancelled() {
                tracing::info!(done, total, "validation cancelled");
                return Err(ServiceError::Cancelled);
            }
            let Some(entry) = entry else {
                continue;
            };
            if entry.is_error() {
                output.failed += 1;
            }
            output.entries.insert(entry.test_taker.clone(), entry);
            done += 1;
            progress.report_ratio(done, total, &format!("{done}/{total} test-takers"));
        }
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        progress.finish("validation complete");

        output.orphans = grouping
            .orphans
            .iter()
            .map(|(id, submissions)| OrphanRecord {
                test_taker: id.clone(),
                submission_ids: submissions.iter().map(|s| s.id.clone()).collect(),
                answers: merge_resolved(submissions),
            })
            .collect();

        tracing::info!(
            test_takers = output.entries.len(),
            failed = output.failed,
            orphans = output.orphans.len(),
            "aggregation complete"
        );
        Ok(output)
    }
}

/// Completion state of one instrument.
///
/// Complete when every question is answered, or when the instrument ended
/// early (terminated or timed out) with at least one answer and nothing
/// answered after the end point.
pub fn task_state(verdict: &TaskVerdict) -> TaskState {
    if verdict.answered_questions == 0 {
        return TaskState::NotStarted;
    }
    if verdict.total_questions > 0 && verdict.answered_questions >= verdict.total_questions {
        return TaskState::Complete;
    }
    if (verdict.terminated || verdict.timed_out) && !verdict.post_termination_answers {
        return TaskState::Complete;
    }
    TaskState::InProgress
}

/// Roll the verdicts of one set's applicable instruments into a status.
pub fn set_status(
    catalogue: &InstrumentCatalogue,
    set: &AssessmentSet,
    test_taker: &TestTaker,
    verdicts: &HashMap<String, TaskVerdict>,
) -> SetStatus {
    let tasks: Vec<TaskSummary> = catalogue
        .applicable(set, test_taker)
        .map(|instrument| match verdicts.get(&instrument.id) {
            Some(v) => TaskSummary {
                instrument_id: instrument.id.clone(),
                name: instrument.name.clone(),
                state: task_state(v),
                answered: v.answered_questions,
                total: v.total_questions,
                terminated: v.terminated,
                timed_out: v.timed_out,
                post_termination_answers: v.post_termination_answers,
            },
            None => TaskSummary {
                instrument_id: instrument.id.clone(),
                name: instrument.name.clone(),
                state: TaskState::NotStarted,
                answered: 0,
                total: instrument.questions.len(),
                terminated: false,
                timed_out: false,
                post_termination_answers: false,
            },
        })
        .collect();

    let tasks_total = tasks.len();
    let tasks_complete = tasks
        .iter()
        .filter(|t| t.state == TaskState::Complete)
        .count();
    let status = if tasks_total > 0 && tasks_complete == tasks_total {
        SetState::Complete
    } else if tasks.iter().any(|t| t.state != TaskState::NotStarted) {
        SetState::Incomplete
    } else {
        SetState::NotStarted
    };

    SetStatus {
        set_id: set.id.clone(),
        name: set.name.clone(),
        status,
        tasks_complete,
        tasks_total,
        tasks,
    }
}

fn build_entry(
    catalogue: &InstrumentCatalogue,
    test_taker: &TestTaker,
    answers: CanonicalAnswerSet,
    verdicts: &HashMap<String, TaskVerdict>,
    has_orphaned_data: bool,
) -> ValidationCacheEntry {
    let sets: Vec<SetStatus> = catalogue
        .sets
        .iter()
        .map(|set| set_status(catalogue, set, test_taker, verdicts))
        .collect();

    let mut applicable = BTreeMap::new();
    let mut flags = FlagSummary::default();
    for task in sets.iter().flat_map(|s| &s.tasks) {
        let Some(verdict) = verdicts.get(&task.instrument_id) else {
            continue;
        };
        if verdict.terminated {
            flags.terminated.push(task.instrument_id.clone());
        }
        if verdict.timed_out {
            flags.timed_out.push(task.instrument_id.clone());
        }
        if verdict.post_termination_answers {
            flags.post_termination_answers.push(task.instrument_id.clone());
        }
        if verdict.termination_mismatch.is_some() {
            flags.termination_mismatches.push(task.instrument_id.clone());
        }
        applicable.insert(task.instrument_id.clone(), verdict.clone());
    }

    let complete: usize = sets.iter().map(|s| s.tasks_complete).sum();
    let total: usize = sets.iter().map(|s| s.tasks_total).sum();

    ValidationCacheEntry {
        test_taker: test_taker.id.clone(),
        answers,
        verdicts: applicable,
        sets,
        completion_pct: completion_pct(complete, total),
        flags,
        has_orphaned_data,
        error: None,
    }
}

/// Percentage rounded to one decimal place.
fn completion_pct(complete: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (complete as f64 * 1000.0 / total as f64).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::parse_catalogue_str;
    use crate::engine::CatalogueRuleEngine;
    use crate::model::{Gender, SourceTag};
    use crate::progress::{ChannelObserver, NoopObserver};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    const CATALOGUE: &str = r#"
[[sets]]
id = "set1"
name = "Set 1"
instruments = ["ERV"]

[[sets]]
id = "set2"
name = "Set 2"
instruments = ["TEC_Male", "TEC_Female"]

[[sets]]
id = "set3"
name = "Set 3"
instruments = ["SYM"]

[[sets]]
id = "set4"
name = "Set 4"
instruments = []

[[instruments]]
id = "ERV"
questions = [
  { id = "ERV_Q1", correct = "1" },
  { id = "ERV_Q2", correct = "1" },
  { id = "ERV_Q3", correct = "1" },
  { id = "ERV_Q4", correct = "1" },
]
termination = { type = "consecutive_incorrect", threshold = 2 }

[[instruments]]
id = "TEC_Male"
condition = { gender = "male" }
questions = [{ id = "TEC_M_Q1" }, { id = "TEC_M_Q2" }]

[[instruments]]
id = "TEC_Female"
condition = { gender = "female" }
questions = [{ id = "TEC_F_Q1" }, { id = "TEC_F_Q2" }]

[[instruments]]
id = "SYM"
timed = true
questions = [
  { id = "SYM_Q1", correct = "1" },
  { id = "SYM_Q2", correct = "1" },
  { id = "SYM_Q3", correct = "1" },
]
"#;

    fn catalogue() -> Arc<InstrumentCatalogue> {
        Arc::new(parse_catalogue_str(CATALOGUE, Path::new("test.toml")).unwrap())
    }

    fn taker(id: &str, gender: Option<Gender>) -> TestTaker {
        TestTaker {
            id: TestTakerId::normalize(id, "C").unwrap(),
            name: id.to_string(),
            gender,
            class_id: None,
            school_id: None,
        }
    }

    fn submission(id: &str, source: SourceTag, fields: &[(&str, &str)]) -> ResolvedSubmission {
        ResolvedSubmission {
            id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            source,
            fields: fields
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn aggregator(config: AggregatorConfig) -> SetAggregator {
        let catalogue = catalogue();
        SetAggregator::new(
            Arc::new(CatalogueRuleEngine::new(Arc::clone(&catalogue))),
            catalogue,
            config,
        )
    }

    fn verdict(answered: usize, total: usize) -> TaskVerdict {
        TaskVerdict {
            instrument_id: "T".into(),
            total_questions: total,
            answered_questions: answered,
            terminated: false,
            termination_index: None,
            post_termination_answers: false,
            timed_out: false,
            questions: vec![],
            termination_mismatch: None,
        }
    }

    #[test]
    fn terminated_without_answers_is_never_complete() {
        let mut v = verdict(0, 20);
        v.terminated = true;
        v.termination_index = Some(0);
        assert_eq!(task_state(&v), TaskState::NotStarted);
    }

    #[test]
    fn task_state_rules() {
        assert_eq!(task_state(&verdict(20, 20)), TaskState::Complete);
        assert_eq!(task_state(&verdict(3, 20)), TaskState::InProgress);

        let mut terminated = verdict(12, 20);
        terminated.terminated = true;
        assert_eq!(task_state(&terminated), TaskState::Complete);

        terminated.post_termination_answers = true;
        assert_eq!(task_state(&terminated), TaskState::InProgress);

        let mut timed = verdict(5, 20);
        timed.timed_out = true;
        assert_eq!(task_state(&timed), TaskState::Complete);
    }

    #[test]
    fn inapplicable_instrument_is_excluded_from_totals() {
        let catalogue = catalogue();
        let set = catalogue.set("set2").unwrap();
        let male = taker("C1", Some(Gender::Male));
        let status = set_status(&catalogue, set, &male, &HashMap::new());

        assert_eq!(status.tasks_total, 1);
        assert_eq!(status.tasks.len(), 1);
        assert_eq!(status.tasks[0].instrument_id, "TEC_Male");
        assert!(status.tasks.iter().all(|t| t.instrument_id != "TEC_Female"));

        let unknown = taker("C2", None);
        let status = set_status(&catalogue, set, &unknown, &HashMap::new());
        assert_eq!(status.tasks_total, 0);
        assert_eq!(status.status, SetState::NotStarted);
    }

    #[test]
    fn completion_rounds_to_one_decimal() {
        assert_eq!(completion_pct(1, 3), 33.3);
        assert_eq!(completion_pct(2, 3), 66.7);
        assert_eq!(completion_pct(0, 0), 0.0);
        assert_eq!(completion_pct(4, 4), 100.0);
    }

    #[tokio::test]
    async fn builds_entries_with_set_status_and_flags() {
        let mut grouping = Grouping::default();
        let id = TestTakerId::normalize("C100", "C").unwrap();
        grouping.groups.insert(
            id.clone(),
            vec![submission(
                "S1",
                SourceTag::Primary,
                &[
                    ("student-id", "C100"),
                    // terminates at ERV_Q2, then answers ERV_Q3
                    ("ERV_Q1", "0"),
                    ("ERV_Q2", "0"),
                    ("ERV_Q3", "1"),
                    ("TEC_F_Q1", "a"),
                    ("TEC_F_Q2", "b"),
                    ("SYM_Q1", "1"),
                ],
            )],
        );
        let takers = vec![taker("C100", Some(Gender::Female)), taker("C200", None)];

        let output = aggregator(AggregatorConfig::default())
            .aggregate(&takers, &grouping, Arc::new(NoopObserver), &CancellationFlag::new())
            .await
            .unwrap();

        assert_eq!(output.entries.len(), 2);
        let entry = output.get_entry("C100");
        assert_eq!(entry.set("set1").unwrap().status, SetState::Incomplete);
        assert_eq!(entry.set("set2").unwrap().status, SetState::Complete);
        // timed out after one answer
        assert_eq!(entry.set("set3").unwrap().status, SetState::Complete);
        assert_eq!(entry.set("set4").unwrap().tasks_total, 0);
        assert_eq!(entry.flags.post_termination_answers, vec!["ERV".to_string()]);
        assert_eq!(entry.flags.timed_out, vec!["SYM".to_string()]);
        assert!(!entry.verdicts.contains_key("TEC_Male"));
        assert_eq!(entry.completion_pct, 66.7);

        let empty = output.get_entry("C200");
        assert!(empty.answers.is_empty());
        assert!(empty.sets.iter().all(|s| s.status == SetState::NotStarted));
        assert_eq!(empty.completion_pct, 0.0);
    }

    #[tokio::test]
    async fn orphans_flagged_and_excluded_by_default() {
        let mut grouping = Grouping::default();
        let id = TestTakerId::normalize("C300", "C").unwrap();
        grouping.orphans.insert(
            id.clone(),
            vec![submission(
                "R_1",
                SourceTag::Secondary,
                &[("student-id", "300"), ("TEC_M_Q1", "x"), ("TEC_M_Q2", "y")],
            )],
        );
        let takers = vec![taker("C300", Some(Gender::Male))];

        let excluded = aggregator(AggregatorConfig::default())
            .aggregate(&takers, &grouping, Arc::new(NoopObserver), &CancellationFlag::new())
            .await
            .unwrap();
        let entry = excluded.get_entry("C300");
        assert!(entry.has_orphaned_data);
        assert!(entry.answers.is_empty());
        assert_eq!(entry.set("set2").unwrap().tasks_complete, 0);
        assert_eq!(excluded.orphans.len(), 1);
        assert_eq!(excluded.orphans[0].submission_ids, vec!["R_1".to_string()]);

        let included = aggregator(AggregatorConfig {
            include_orphans: true,
            ..AggregatorConfig::default()
        })
        .aggregate(&takers, &grouping, Arc::new(NoopObserver), &CancellationFlag::new())
        .await
        .unwrap();
        let entry = included.get_entry("C300");
        assert!(entry.has_orphaned_data);
        assert_eq!(entry.set("set2").unwrap().status, SetState::Complete);
    }

    struct FailingFor(String);

    #[async_trait]
    impl RuleEngine for FailingFor {
        fn name(&self) -> &str {
            "failing"
        }

        async fn validate_all_tasks(
            &self,
            answers: &CanonicalAnswerSet,
        ) -> anyhow::Result<HashMap<String, TaskVerdict>> {
            if answers.value("student-id") == Some(self.0.as_str()) {
                anyhow::bail!("rule table missing");
            }
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn engine_failure_is_isolated_to_one_test_taker() {
        let mut grouping = Grouping::default();
        for id in ["C1", "C2", "C3"] {
            grouping.groups.insert(
                TestTakerId::normalize(id, "C").unwrap(),
                vec![submission(id, SourceTag::Primary, &[("student-id", id)])],
            );
        }
        let takers: Vec<_> = ["C1", "C2", "C3"].iter().map(|id| taker(id, None)).collect();
        let aggregator = SetAggregator::new(
            Arc::new(FailingFor("C2".into())),
            catalogue(),
            AggregatorConfig::default(),
        );

        let (observer, mut rx) = ChannelObserver::new();
        let output = aggregator
            .aggregate(&takers, &grouping, Arc::new(observer), &CancellationFlag::new())
            .await
            .unwrap();

        assert_eq!(output.entries.len(), 3);
        assert_eq!(output.failed, 1);
        let failed = output.get_entry("C2");
        assert!(failed.error.as_deref().unwrap().contains("rule table missing"));
        assert!(output.get_entry("C1").error.is_none());

        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.percent >= last);
            last = event.percent;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_cancelled() {
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let takers = vec![taker("C1", None)];
        let err = aggregator(AggregatorConfig::default())
            .aggregate(&takers, &Grouping::default(), Arc::new(NoopObserver), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
    }

    impl AggregateOutput {
        fn get_entry(&self, id: &str) -> &ValidationCacheEntry {
            &self.entries[&TestTakerId::normalize(id, "C").unwrap()]
        }
    }
}
