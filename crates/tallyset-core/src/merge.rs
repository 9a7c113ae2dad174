//! Cross-source merge.
//!
//! Resolves field names for both back-ends, groups submissions by normalized
//! identity, and reduces each group to a [`CanonicalAnswerSet`] where the
//! earliest non-empty answer for a field wins.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::model::{CanonicalAnswerSet, MergedAnswer, RawSubmission, SourceTag, TestTakerId};

/// How a canonical field is encoded in the secondary source's export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSpec {
    /// The answer sits under its own key.
    Direct { key: String },
    /// A matrix cell, flattened by the export to the literal key `parent#child`.
    MatrixCell { parent: String, child: String },
    /// A free-text companion stored under `base` + `suffix` (e.g. `QID7_TEXT`).
    TextCompanion {
        base: String,
        #[serde(default = "default_text_suffix")]
        suffix: String,
    },
}

fn default_text_suffix() -> String {
    "_TEXT".to_string()
}

impl FieldSpec {
    /// The literal key this spec is looked up by.
    pub fn encoded_key(&self) -> String {
        match self {
            FieldSpec::Direct { key } => key.clone(),
            FieldSpec::MatrixCell { parent, child } => format!("{parent}#{child}"),
            FieldSpec::TextCompanion { base, suffix } => format!("{base}{suffix}"),
        }
    }

    /// Find this field's answer in a raw secondary-source submission.
    pub fn resolve<'a>(&self, submission: &'a RawSubmission) -> Option<&'a str> {
        let key = self.encoded_key();
        submission
            .answers
            .iter()
            .find(|a| a.question_id == key)
            .map(|a| a.value.as_str())
    }
}

/// Declarative map from canonical field name to secondary-source encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryFieldMap {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl SecondaryFieldMap {
    /// Load a field map from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read field map: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse field map: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    /// Warnings for encoded keys claimed by more than one canonical field.
    pub fn validate(&self) -> Vec<String> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        let mut warnings = Vec::new();
        for (field, spec) in &self.fields {
            let key = spec.encoded_key();
            if let Some(previous) = seen.insert(key.clone(), field) {
                warnings.push(format!(
                    "encoded key '{key}' is mapped by both '{previous}' and '{field}'"
                ));
            }
        }
        warnings
    }
}

/// Where the test-taker identity lives and how to normalize it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Canonical field name carrying the identity.
    pub field: String,
    /// Type tag the secondary source omits.
    pub prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            field: "student-id".to_string(),
            prefix: "C".to_string(),
        }
    }
}

/// A raw submission with every answer expressed as a canonical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubmission {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source: SourceTag,
    /// (canonical field, trimmed value) in source order.
    pub fields: Vec<(String, String)>,
}

impl ResolvedSubmission {
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, v)| f == field && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }
}

/// Submissions grouped by normalized identity.
#[derive(Debug, Clone, Default)]
pub struct Grouping {
    /// Identities with at least one primary-source submission. Secondary
    /// submissions for the same identity are included.
    pub groups: BTreeMap<TestTakerId, Vec<ResolvedSubmission>>,
    /// Secondary-only identities.
    pub orphans: BTreeMap<TestTakerId, Vec<ResolvedSubmission>>,
    /// Records or answers skipped as malformed.
    pub skipped: Vec<MergeError>,
}

/// Reconciles submissions across both back-ends.
#[derive(Debug, Clone)]
pub struct CrossSourceMerger {
    /// encoded key -> canonical field
    index: HashMap<String, String>,
    identity: IdentityConfig,
}

impl CrossSourceMerger {
    pub fn new(field_map: &SecondaryFieldMap, identity: IdentityConfig) -> Self {
        let mut index = HashMap::with_capacity(field_map.fields.len());
        for (field, spec) in &field_map.fields {
            index.entry(spec.encoded_key()).or_insert_with(|| field.clone());
        }
        Self { index, identity }
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    /// Express a raw submission in canonical field names.
    ///
    /// Primary-source answers use their declared field name; answers without
    /// one are reported and skipped. Secondary-source keys that the field map
    /// does not mention are ignored (export metadata and the like).
    pub fn resolve(&self, raw: &RawSubmission) -> (ResolvedSubmission, Vec<MergeError>) {
        let mut fields = Vec::with_capacity(raw.answers.len());
        let mut errors = Vec::new();

        for answer in &raw.answers {
            let field = match raw.source {
                SourceTag::Primary => match &answer.field_name {
                    Some(name) if !name.trim().is_empty() => name.trim().to_string(),
                    _ => {
                        errors.push(MergeError::UnnamedField {
                            submission_id: raw.id.clone(),
                            question_id: answer.question_id.clone(),
                        });
                        continue;
                    }
                },
                SourceTag::Secondary => match self.index.get(&answer.question_id) {
                    Some(name) => name.clone(),
                    None => continue,
                },
            };
            fields.push((field, answer.value.trim().to_string()));
        }

        (
            ResolvedSubmission {
                id: raw.id.clone(),
                created_at: raw.created_at,
                source: raw.source,
                fields,
            },
            errors,
        )
    }

    /// Normalized identity of a resolved submission.
    pub fn identity_of(&self, resolved: &ResolvedSubmission) -> Option<TestTakerId> {
        resolved
            .value(&self.identity.field)
            .and_then(|raw| TestTakerId::normalize(raw, &self.identity.prefix))
    }

    /// Resolve and group submissions by normalized identity, separating
    /// secondary-only identities as orphans.
    ///
    /// A submission seen twice (same source and id) is only kept once.
    pub fn group<'a, I>(&self, raws: I) -> Grouping
    where
        I: IntoIterator<Item = &'a RawSubmission>,
    {
        let mut grouping = Grouping::default();
        let mut seen: HashSet<(SourceTag, &str)> = HashSet::new();
        let mut by_id: BTreeMap<TestTakerId, Vec<ResolvedSubmission>> = BTreeMap::new();

        for raw in raws {
            if !seen.insert((raw.source, raw.id.as_str())) {
                tracing::debug!("duplicate {} submission {} ignored", raw.source, raw.id);
                continue;
            }
            let (resolved, errors) = self.resolve(raw);
            for e in &errors {
                tracing::warn!("skipping malformed answer: {e}");
            }
            grouping.skipped.extend(errors);

            let Some(id) = self.identity_of(&resolved) else {
                let err = MergeError::MissingIdentity {
                    submission_id: raw.id.clone(),
                    field: self.identity.field.clone(),
                };
                tracing::warn!("skipping submission: {err}");
                grouping.skipped.push(err);
                continue;
            };
            by_id.entry(id).or_default().push(resolved);
        }

        for (id, submissions) in by_id {
            if submissions.iter().any(|s| s.source == SourceTag::Primary) {
                grouping.groups.insert(id, submissions);
            } else {
                tracing::debug!("identity {id} has secondary-source data only");
                grouping.orphans.insert(id, submissions);
            }
        }

        grouping
    }

    /// Merge the raw submissions of one identity.
    pub fn merge(&self, raws: &[RawSubmission]) -> CanonicalAnswerSet {
        let resolved: Vec<ResolvedSubmission> = raws
            .iter()
            .map(|raw| {
                let (resolved, errors) = self.resolve(raw);
                for e in errors {
                    tracing::warn!("skipping malformed answer: {e}");
                }
                resolved
            })
            .collect();
        merge_resolved(&resolved)
    }
}

/// Earliest-wins merge of one identity's resolved submissions.
///
/// Submissions are ordered by creation time, ties broken by source then id,
/// so the result does not depend on input order. Within one submission the
/// first occurrence of a field wins.
pub fn merge_resolved(submissions: &[ResolvedSubmission]) -> CanonicalAnswerSet {
    let mut ordered: Vec<&ResolvedSubmission> = submissions.iter().collect();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.source.cmp(&b.source))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut answers = CanonicalAnswerSet::new();
    for submission in ordered {
        for (field, value) in &submission.fields {
            if value.is_empty() {
                continue;
            }
            answers.insert_if_absent(
                field,
                MergedAnswer {
                    value: value.clone(),
                    submission_id: submission.id.clone(),
                    source: submission.source,
                },
            );
        }
    }
    answers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnswerTriple;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 9, minute, 0).unwrap()
    }

    fn primary(id: &str, minute: u32, answers: &[(&str, &str)]) -> RawSubmission {
        RawSubmission {
            id: id.into(),
            created_at: at(minute),
            source: SourceTag::Primary,
            answers: answers
                .iter()
                .enumerate()
                .map(|(i, (f, v))| AnswerTriple::named(&(i + 1).to_string(), f, v))
                .collect(),
        }
    }

    fn secondary(id: &str, minute: u32, answers: &[(&str, &str)]) -> RawSubmission {
        RawSubmission {
            id: id.into(),
            created_at: at(minute),
            source: SourceTag::Secondary,
            answers: answers
                .iter()
                .map(|(k, v)| AnswerTriple::encoded(k, v))
                .collect(),
        }
    }

    fn field_map() -> SecondaryFieldMap {
        SecondaryFieldMap::from_toml_str(
            r#"
[fields.student-id]
kind = "direct"
key = "QID125"

[fields.A]
kind = "direct"
key = "QID1"

[fields.ERV_Q1]
kind = "matrix_cell"
parent = "QID5"
child = "1_1"

[fields.ToM_Q3a_TEXT]
kind = "text_companion"
base = "QID7"
"#,
        )
        .unwrap()
    }

    fn merger() -> CrossSourceMerger {
        CrossSourceMerger::new(&field_map(), IdentityConfig::default())
    }

    #[test]
    fn earliest_answer_wins_per_field() {
        let raws = vec![
            primary("s2", 20, &[("student-id", "C100"), ("A", "y"), ("B", "z")]),
            primary("s1", 10, &[("student-id", "C100"), ("A", "x"), ("B", "")]),
        ];
        let merged = merger().merge(&raws);

        let a = merged.get("A").unwrap();
        assert_eq!(a.value, "x");
        assert_eq!(a.submission_id, "s1");
        let b = merged.get("B").unwrap();
        assert_eq!(b.value, "z");
        assert_eq!(b.submission_id, "s2");
    }

    #[test]
    fn merge_is_independent_of_input_order() {
        let raws = vec![
            primary("p1", 5, &[("student-id", "C1"), ("A", "1"), ("ERV_Q1", "")]),
            secondary("r1", 5, &[("QID125", "1"), ("QID1", "2"), ("QID5#1_1", "b")]),
            primary("p2", 7, &[("student-id", "C1"), ("ERV_Q1", "c")]),
            secondary("r2", 3, &[("QID125", "1"), ("QID7_TEXT", "cat")]),
        ];
        let m = merger();
        let expected = m.merge(&raws);

        let mut reversed = raws.clone();
        reversed.reverse();
        assert_eq!(m.merge(&reversed), expected);

        for shift in 1..raws.len() {
            let mut rotated = raws.clone();
            rotated.rotate_left(shift);
            assert_eq!(m.merge(&rotated), expected);
        }

        // equal timestamps: primary sorts before secondary
        assert_eq!(expected.value("A"), Some("1"));
        assert_eq!(expected.value("ERV_Q1"), Some("b"));
        assert_eq!(expected.value("ToM_Q3a_TEXT"), Some("cat"));
    }

    #[test]
    fn merge_is_idempotent() {
        let raws = vec![
            primary("p1", 1, &[("student-id", "C1"), ("A", "1")]),
            primary("p2", 2, &[("student-id", "C1"), ("A", "2")]),
        ];
        let m = merger();
        assert_eq!(m.merge(&raws), m.merge(&raws));
    }

    #[test]
    fn secondary_encodings_resolve_through_field_map() {
        let raw = secondary(
            "r1",
            1,
            &[
                ("QID125", "100"),
                ("QID5#1_1", "2"),
                ("QID7_TEXT", "dog"),
                ("recordedDate", "2025-10-01T09:00:00Z"),
            ],
        );
        let (resolved, errors) = merger().resolve(&raw);
        assert!(errors.is_empty());
        assert_eq!(resolved.value("ERV_Q1"), Some("2"));
        assert_eq!(resolved.value("ToM_Q3a_TEXT"), Some("dog"));
        assert_eq!(resolved.fields.len(), 3, "unmapped metadata is ignored");

        let map = field_map();
        assert_eq!(map.spec("ERV_Q1").unwrap().resolve(&raw), Some("2"));
        assert_eq!(map.spec("ToM_Q3a_TEXT").unwrap().encoded_key(), "QID7_TEXT");
    }

    #[test]
    fn secondary_only_identity_is_orphaned() {
        let raws = vec![
            primary("p1", 1, &[("student-id", "C1"), ("A", "x")]),
            secondary("r1", 2, &[("QID125", "1"), ("QID1", "y")]),
            secondary("r2", 3, &[("QID125", "2"), ("QID1", "z")]),
        ];
        let grouping = merger().group(&raws);

        let c1 = TestTakerId::normalize("C1", "C").unwrap();
        let c2 = TestTakerId::normalize("C2", "C").unwrap();
        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.groups[&c1].len(), 2, "secondary joins primary group");
        assert!(!grouping.groups.contains_key(&c2));
        assert_eq!(grouping.orphans[&c2][0].id, "r2");
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let mut unnamed = primary("p2", 2, &[("student-id", "C1"), ("B", "b")]);
        unnamed.answers.push(AnswerTriple {
            question_id: "99".into(),
            value: "v".into(),
            field_name: None,
        });
        let raws = vec![
            primary("p1", 1, &[("A", "no identity")]),
            unnamed,
            primary("p2", 2, &[("student-id", "C1")]),
        ];
        let grouping = merger().group(&raws);

        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.skipped.len(), 2);
        assert!(grouping
            .skipped
            .iter()
            .any(|e| matches!(e, MergeError::MissingIdentity { submission_id, .. } if submission_id == "p1")));
        let c1 = TestTakerId::normalize("C1", "C").unwrap();
        assert_eq!(grouping.groups[&c1].len(), 1, "duplicate p2 ignored");
        let merged = merge_resolved(&grouping.groups[&c1]);
        assert_eq!(merged.value("B"), Some("b"));
    }

    #[test]
    fn duplicate_encoded_keys_are_reported() {
        let map = SecondaryFieldMap::from_toml_str(
            r#"
[fields.X]
kind = "direct"
key = "QID5#1"

[fields.Y]
kind = "matrix_cell"
parent = "QID5"
child = "1"
"#,
        )
        .unwrap();
        let warnings = map.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("QID5#1"));
    }
}
