//! Instrument catalogue.
//!
//! Loads the declarative rulebook (assessment sets, instruments, scoring keys,
//! termination rules, applicability conditions) from TOML and validates it.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{Gender, TestTaker};

/// Number of assessment sets a catalogue is expected to declare.
pub const SET_COUNT: usize = 4;

/// The declarative rulebook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentCatalogue {
    pub sets: Vec<AssessmentSet>,
    pub instruments: Vec<Instrument>,
}

/// A top-level grouping of instruments with its own completion dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentSet {
    pub id: String,
    pub name: String,
    /// Instrument ids in display order.
    pub instruments: Vec<String>,
}

/// One assessment module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub name: String,
    pub questions: Vec<QuestionDef>,
    /// Who the instrument applies to. `None` means everyone.
    pub condition: Option<Condition>,
    pub termination: Option<TerminationRule>,
    /// Timed instruments end when the clock runs out.
    pub timed: bool,
}

/// A question and its scoring key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionDef {
    /// Canonical field name of the answer.
    pub id: String,
    /// Correct answer; `None` for unscored questions.
    #[serde(default)]
    pub correct: Option<String>,
}

/// Applicability condition. Only gender is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub gender: Gender,
}

impl Condition {
    /// A test-taker with unknown gender does not satisfy a gender condition.
    pub fn applies_to(&self, test_taker: &TestTaker) -> bool {
        test_taker.gender == Some(self.gender)
    }
}

/// Early-termination rule families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminationRule {
    /// Terminate once `threshold` consecutive answers are incorrect.
    ConsecutiveIncorrect { threshold: usize },
    /// Terminate when a stage cannot reach its minimum correct count.
    StageThreshold { stages: Vec<Stage> },
}

/// One stage of a stage-threshold instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub questions: Vec<String>,
    pub min_correct: usize,
    /// Field where the administrator recorded whether this stage terminated.
    #[serde(default)]
    pub recorded_field: Option<String>,
}

impl Instrument {
    pub fn applies_to(&self, test_taker: &TestTaker) -> bool {
        self.condition.map_or(true, |c| c.applies_to(test_taker))
    }

    pub fn question_index(&self, question_id: &str) -> Option<usize> {
        self.questions.iter().position(|q| q.id == question_id)
    }
}

impl InstrumentCatalogue {
    pub fn instrument(&self, id: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }

    pub fn set(&self, id: &str) -> Option<&AssessmentSet> {
        self.sets.iter().find(|s| s.id == id)
    }

    /// Instruments of `set` that apply to `test_taker`, in set order.
    pub fn applicable<'a>(
        &'a self,
        set: &'a AssessmentSet,
        test_taker: &'a TestTaker,
    ) -> impl Iterator<Item = &'a Instrument> + 'a {
        set.instruments
            .iter()
            .filter_map(|id| self.instrument(id))
            .filter(|i| i.applies_to(test_taker))
    }
}

#[derive(Debug, Deserialize)]
struct TomlCatalogue {
    #[serde(default)]
    sets: Vec<AssessmentSet>,
    #[serde(default)]
    instruments: Vec<TomlInstrument>,
}

#[derive(Debug, Deserialize)]
struct TomlInstrument {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    questions: Vec<QuestionDef>,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    termination: Option<TerminationRule>,
    #[serde(default)]
    timed: bool,
}

/// Parse a catalogue TOML file.
pub fn parse_catalogue(path: &Path) -> Result<InstrumentCatalogue> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalogue: {}", path.display()))?;

    parse_catalogue_str(&content, path)
}

/// Parse catalogue TOML from a string (useful for testing).
pub fn parse_catalogue_str(content: &str, source_path: &Path) -> Result<InstrumentCatalogue> {
    let parsed: TomlCatalogue = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let instruments: Vec<Instrument> = parsed
        .instruments
        .into_iter()
        .map(|i| Instrument {
            name: i.name.unwrap_or_else(|| i.id.clone()),
            id: i.id,
            questions: i.questions,
            condition: i.condition,
            termination: i.termination,
            timed: i.timed,
        })
        .collect();

    // A stage with none of its instrument's questions can never be scored.
    for instrument in &instruments {
        if let Some(TerminationRule::StageThreshold { stages }) = &instrument.termination {
            for (n, stage) in stages.iter().enumerate() {
                anyhow::ensure!(
                    stage
                        .questions
                        .iter()
                        .any(|q| instrument.question_index(q).is_some()),
                    "{}: instrument {} termination stage {} has no questions of this instrument",
                    source_path.display(),
                    instrument.id,
                    n + 1
                );
            }
        }
    }

    Ok(InstrumentCatalogue {
        sets: parsed.sets,
        instruments,
    })
}

/// A warning from catalogue validation.
#[derive(Debug, Clone)]
pub struct CatalogueWarning {
    /// The instrument or set the warning is about.
    pub subject: Option<String>,
    pub message: String,
}

/// Validate a catalogue for common authoring mistakes.
pub fn validate_catalogue(catalogue: &InstrumentCatalogue) -> Vec<CatalogueWarning> {
    let mut warnings = Vec::new();

    if catalogue.sets.len() != SET_COUNT {
        warnings.push(CatalogueWarning {
            subject: None,
            message: format!(
                "expected {SET_COUNT} assessment sets, found {}",
                catalogue.sets.len()
            ),
        });
    }

    let mut seen_ids = HashSet::new();
    for instrument in &catalogue.instruments {
        if !seen_ids.insert(instrument.id.as_str()) {
            warnings.push(CatalogueWarning {
                subject: Some(instrument.id.clone()),
                message: format!("duplicate instrument ID: {}", instrument.id),
            });
        }
    }

    let mut referenced = HashSet::new();
    for set in &catalogue.sets {
        for id in &set.instruments {
            referenced.insert(id.as_str());
            if catalogue.instrument(id).is_none() {
                warnings.push(CatalogueWarning {
                    subject: Some(set.id.clone()),
                    message: format!("set references unknown instrument: {id}"),
                });
            }
        }
    }

    for instrument in &catalogue.instruments {
        let subject = Some(instrument.id.clone());

        if !referenced.contains(instrument.id.as_str()) {
            warnings.push(CatalogueWarning {
                subject: subject.clone(),
                message: "instrument is not part of any set".into(),
            });
        }

        if instrument.questions.is_empty() {
            warnings.push(CatalogueWarning {
                subject: subject.clone(),
                message: "instrument has no questions".into(),
            });
        }

        let mut question_ids = HashSet::new();
        for q in &instrument.questions {
            if !question_ids.insert(q.id.as_str()) {
                warnings.push(CatalogueWarning {
                    subject: subject.clone(),
                    message: format!("duplicate question ID: {}", q.id),
                });
            }
        }

        match &instrument.termination {
            Some(TerminationRule::ConsecutiveIncorrect { threshold }) if *threshold == 0 => {
                warnings.push(CatalogueWarning {
                    subject: subject.clone(),
                    message: "consecutive_incorrect threshold must be at least 1".into(),
                });
            }
            Some(TerminationRule::StageThreshold { stages }) => {
                for (n, stage) in stages.iter().enumerate() {
                    for q in &stage.questions {
                        if !question_ids.contains(q.as_str()) {
                            warnings.push(CatalogueWarning {
                                subject: subject.clone(),
                                message: format!("stage {} references unknown question: {q}", n + 1),
                            });
                        }
                    }
                    if stage.min_correct > stage.questions.len() {
                        warnings.push(CatalogueWarning {
                            subject: subject.clone(),
                            message: format!(
                                "stage {} needs {} correct but has {} questions",
                                n + 1,
                                stage.min_correct,
                                stage.questions.len()
                            ),
                        });
                    }
                }
            }
            _ => {}
        }

        if instrument.timed && instrument.termination.is_some() {
            warnings.push(CatalogueWarning {
                subject,
                message: "timed instrument also declares a termination rule".into(),
            });
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestTakerId;
    use std::path::PathBuf;

    const CATALOGUE: &str = r#"
[[sets]]
id = "set1"
name = "Set 1"
instruments = ["ERV", "TEC_Male", "TEC_Female"]

[[sets]]
id = "set2"
name = "Set 2"
instruments = ["SYM"]

[[sets]]
id = "set3"
name = "Set 3"
instruments = []

[[sets]]
id = "set4"
name = "Set 4"
instruments = []

[[instruments]]
id = "ERV"
name = "Expressive Vocabulary"
questions = [
    { id = "ERV_Q1", correct = "1" },
    { id = "ERV_Q2", correct = "2" },
]
termination = { type = "consecutive_incorrect", threshold = 5 }

[[instruments]]
id = "TEC_Male"
questions = [{ id = "TEC_Male_Q1" }]
condition = { gender = "M" }

[[instruments]]
id = "TEC_Female"
questions = [{ id = "TEC_Female_Q1" }]
condition = { gender = "female" }

[[instruments]]
id = "SYM"
timed = true
questions = [{ id = "SYM_Q1", correct = "Y" }]
"#;

    fn catalogue() -> InstrumentCatalogue {
        parse_catalogue_str(CATALOGUE, &PathBuf::from("catalogue.toml")).unwrap()
    }

    fn taker(gender: Option<Gender>) -> TestTaker {
        TestTaker {
            id: TestTakerId::normalize("C1", "C").unwrap(),
            name: String::new(),
            gender,
            class_id: None,
            school_id: None,
        }
    }

    #[test]
    fn parse_valid_catalogue() {
        let cat = catalogue();
        assert_eq!(cat.sets.len(), 4);
        assert_eq!(cat.instruments.len(), 4);
        let erv = cat.instrument("ERV").unwrap();
        assert_eq!(erv.questions[1].correct.as_deref(), Some("2"));
        assert_eq!(
            erv.termination,
            Some(TerminationRule::ConsecutiveIncorrect { threshold: 5 })
        );
        assert_eq!(cat.instrument("TEC_Male").unwrap().name, "TEC_Male");
        assert!(cat.instrument("SYM").unwrap().timed);
        assert!(validate_catalogue(&cat).is_empty());
    }

    #[test]
    fn gender_condition_uses_normalized_codes() {
        let cat = catalogue();
        let set1 = cat.set("set1").unwrap();

        let male_taker = taker(Some(Gender::Male));
        let male: Vec<_> = cat
            .applicable(set1, &male_taker)
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(male, vec!["ERV", "TEC_Male"]);

        let unknown_taker = taker(None);
        let unknown: Vec<_> = cat
            .applicable(set1, &unknown_taker)
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(unknown, vec!["ERV"]);
    }

    #[test]
    fn stage_without_known_questions_is_rejected() {
        let toml = r#"
[[instruments]]
id = "CWR"
questions = [{ id = "Q1", correct = "a" }]

[instruments.termination]
type = "stage_threshold"

[[instruments.termination.stages]]
questions = ["Q1"]
min_correct = 1

[[instruments.termination.stages]]
questions = ["Q8", "Q9"]
min_correct = 1
"#;
        let err = parse_catalogue_str(toml, &PathBuf::from("t.toml")).unwrap_err();
        assert!(err.to_string().contains("instrument CWR termination stage 2"));
    }

    #[test]
    fn parse_stage_threshold_rule() {
        let toml = r#"
[[instruments]]
id = "CWR"
questions = [{ id = "Q1", correct = "a" }, { id = "Q2", correct = "b" }]

[instruments.termination]
type = "stage_threshold"

[[instruments.termination.stages]]
questions = ["Q1", "Q2", "Q9"]
min_correct = 4
recorded_field = "CWR_Ter1"
"#;
        let cat = parse_catalogue_str(toml, &PathBuf::from("t.toml")).unwrap();
        let Some(TerminationRule::StageThreshold { stages }) = &cat.instruments[0].termination
        else {
            panic!("expected stage threshold rule");
        };
        assert_eq!(stages[0].recorded_field.as_deref(), Some("CWR_Ter1"));

        let warnings = validate_catalogue(&cat);
        assert!(warnings.iter().any(|w| w.message.contains("expected 4")));
        assert!(warnings.iter().any(|w| w.message.contains("unknown question: Q9")));
        assert!(warnings.iter().any(|w| w.message.contains("needs 4 correct")));
        assert!(warnings.iter().any(|w| w.message.contains("not part of any set")));
    }

    #[test]
    fn validate_unknown_and_duplicate_instruments() {
        let mut cat = catalogue();
        cat.sets[2].instruments.push("GHOST".into());
        cat.instruments.push(cat.instruments[0].clone());
        let warnings = validate_catalogue(&cat);
        assert!(warnings.iter().any(|w| w.message.contains("unknown instrument: GHOST")));
        assert!(warnings.iter().any(|w| w.message.contains("duplicate instrument ID")));
    }

    #[test]
    fn parse_malformed_toml() {
        let result = parse_catalogue_str("[[sets]\nid =", &PathBuf::from("bad.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_gender_code_is_rejected() {
        let toml = r#"
[[instruments]]
id = "X"
questions = []
condition = { gender = "other" }
"#;
        assert!(parse_catalogue_str(toml, &PathBuf::from("t.toml")).is_err());
    }
}
