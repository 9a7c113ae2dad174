//! Declarative rule engine driven by the instrument catalogue.
//!
//! Scores each question against its key and applies the instrument's
//! termination rule. The aggregator only sees it through [`RuleEngine`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalogue::{Instrument, InstrumentCatalogue, TerminationRule};
use crate::model::CanonicalAnswerSet;
use crate::results::{QuestionVerdict, TaskVerdict, TerminationMismatch};
use crate::traits::RuleEngine;

/// Evaluates every catalogue instrument against a canonical answer set.
pub struct CatalogueRuleEngine {
    catalogue: Arc<InstrumentCatalogue>,
}

impl CatalogueRuleEngine {
    pub fn new(catalogue: Arc<InstrumentCatalogue>) -> Self {
        Self { catalogue }
    }

    /// Verdict for one instrument.
    pub fn evaluate(&self, instrument: &Instrument, answers: &CanonicalAnswerSet) -> TaskVerdict {
        let questions: Vec<QuestionVerdict> = instrument
            .questions
            .iter()
            .map(|q| {
                let answer = answers.value(&q.id).map(str::to_string);
                let correct = match (&answer, &q.correct) {
                    (Some(given), Some(key)) => Some(answer_matches(given, key)),
                    _ => None,
                };
                QuestionVerdict {
                    id: q.id.clone(),
                    answer,
                    correct,
                }
            })
            .collect();

        let answered: Vec<usize> = questions
            .iter()
            .enumerate()
            .filter(|(_, q)| q.answer.is_some())
            .map(|(i, _)| i)
            .collect();
        let last_answered = answered.last().copied();

        let (termination_index, termination_mismatch) = match &instrument.termination {
            Some(TerminationRule::ConsecutiveIncorrect { threshold }) => (
                consecutive_incorrect(instrument, &questions, *threshold, last_answered),
                None,
            ),
            Some(TerminationRule::StageThreshold { stages }) => {
                stage_threshold(instrument, &questions, stages, answers)
            }
            None => (None, None),
        };

        let post_termination_answers = match (termination_index, last_answered) {
            (Some(end), Some(last)) => last > end,
            _ => false,
        };

        // answers form an unbroken prefix that stops before the end
        let timed_out = instrument.timed
            && !answered.is_empty()
            && answered.len() < questions.len()
            && last_answered.map_or(false, |last| last + 1 == answered.len());

        TaskVerdict {
            instrument_id: instrument.id.clone(),
            total_questions: questions.len(),
            answered_questions: answered.len(),
            terminated: termination_index.is_some(),
            termination_index,
            post_termination_answers,
            timed_out,
            questions,
            termination_mismatch,
        }
    }
}

#[async_trait]
impl RuleEngine for CatalogueRuleEngine {
    fn name(&self) -> &str {
        "catalogue"
    }

    async fn validate_all_tasks(
        &self,
        answers: &CanonicalAnswerSet,
    ) -> anyhow::Result<HashMap<String, TaskVerdict>> {
        Ok(self
            .catalogue
            .instruments
            .iter()
            .map(|instrument| (instrument.id.clone(), self.evaluate(instrument, answers)))
            .collect())
    }
}

fn answer_matches(given: &str, key: &str) -> bool {
    given.trim().eq_ignore_ascii_case(key.trim())
}

/// Index of the question completing the first run of `threshold` incorrect
/// answers. Only questions up to the last answered one are considered;
/// skipped scored questions count as incorrect, unscored ones are ignored.
fn consecutive_incorrect(
    instrument: &Instrument,
    questions: &[QuestionVerdict],
    threshold: usize,
    last_answered: Option<usize>,
) -> Option<usize> {
    let last = last_answered?;
    if threshold == 0 {
        return None;
    }
    let mut streak = 0;
    for (i, (def, verdict)) in instrument.questions.iter().zip(questions).enumerate() {
        if i > last {
            break;
        }
        if def.correct.is_none() {
            continue;
        }
        if verdict.correct == Some(true) {
            streak = 0;
        } else {
            streak += 1;
            if streak >= threshold {
                return Some(i);
            }
        }
    }
    None
}

/// Walk stages in order; a stage fails once it can no longer reach its
/// minimum correct count. Recorded flags are compared with the calculated
/// outcome of each evaluated stage.
fn stage_threshold(
    instrument: &Instrument,
    questions: &[QuestionVerdict],
    stages: &[crate::catalogue::Stage],
    answers: &CanonicalAnswerSet,
) -> (Option<usize>, Option<TerminationMismatch>) {
    let mut mismatch = None;

    for stage in stages {
        let indices: Vec<usize> = stage
            .questions
            .iter()
            .filter_map(|q| instrument.question_index(q))
            .collect();
        if indices.is_empty() {
            tracing::debug!(instrument = %instrument.id, "stage has no known questions, skipped");
            continue;
        }
        let correct = indices
            .iter()
            .filter(|&&i| questions[i].correct == Some(true))
            .count();
        let unanswered = indices
            .iter()
            .filter(|&&i| questions[i].answer.is_none())
            .count();
        let failed = correct + unanswered < stage.min_correct;

        let recorded = stage
            .recorded_field
            .as_deref()
            .and_then(|field| answers.value(field))
            .and_then(parse_flag);
        if let Some(recorded) = recorded {
            if recorded != failed && mismatch.is_none() {
                mismatch = Some(TerminationMismatch {
                    recorded,
                    calculated: failed,
                });
            }
        }

        if failed {
            return (indices.iter().copied().max(), mismatch);
        }
    }

    (None, mismatch)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}
