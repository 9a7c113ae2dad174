//! Core data model types for tallyset.
//!
//! Raw submissions as fetched from the two back-ends, normalized test-taker
//! identities, roster records and the merged canonical answer set.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which back-end produced a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// The form-collection service.
    Primary,
    /// The survey service.
    Secondary,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::Primary => write!(f, "primary"),
            SourceTag::Secondary => write!(f, "secondary"),
        }
    }
}

/// One answer inside a raw submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerTriple {
    /// Source-specific question identifier (a QID, or an encoded export key).
    pub question_id: String,
    /// The answer exactly as delivered.
    pub value: String,
    /// Field name declared by the source, if it declares one.
    #[serde(default)]
    pub field_name: Option<String>,
}

impl AnswerTriple {
    pub fn named(question_id: &str, field_name: &str, value: &str) -> Self {
        Self {
            question_id: question_id.to_string(),
            value: value.to_string(),
            field_name: Some(field_name.to_string()),
        }
    }

    pub fn encoded(key: &str, value: &str) -> Self {
        Self {
            question_id: key.to_string(),
            value: value.to_string(),
            field_name: None,
        }
    }
}

/// One response instance from one source. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSubmission {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source: SourceTag,
    pub answers: Vec<AnswerTriple>,
}

/// A normalized test-taker key.
///
/// The secondary source drops the leading type tag (`10001` instead of
/// `C10001`); normalization restores it so keys compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestTakerId(String);

impl TestTakerId {
    /// Normalize a raw identifier. Returns `None` for blank input.
    pub fn normalize(raw: &str, prefix: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let upper = trimmed.to_uppercase();
        let prefix = prefix.to_uppercase();
        if prefix.is_empty() || upper.starts_with(&prefix) {
            Some(Self(upper))
        } else {
            Some(Self(format!("{prefix}{upper}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestTakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gender as used by instrument applicability conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Gender {
    Male,
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => write!(f, "male"),
            Gender::Female => write!(f, "female"),
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    /// Accepts single-letter codes as well as full words.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "m" | "male" | "boy" => Ok(Gender::Male),
            "f" | "female" | "girl" => Ok(Gender::Female),
            other => Err(format!("unknown gender: {other}")),
        }
    }
}

impl TryFrom<String> for Gender {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Gender> for String {
    fn from(value: Gender) -> Self {
        value.to_string()
    }
}

/// A roster entry supplied by the identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTaker {
    pub id: TestTakerId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub class_id: Option<String>,
    #[serde(default)]
    pub school_id: Option<String>,
}

/// A decrypted roster export: the set of test-takers a dashboard covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    pub test_takers: Vec<TestTaker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterRecord {
    #[serde(alias = "coreId", alias = "studentId")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    class_id: Option<String>,
    #[serde(default)]
    school_id: Option<String>,
}

impl Roster {
    /// Load a roster from a JSON array of records.
    pub fn load_json(path: &Path, prefix: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read roster: {}", path.display()))?;
        Self::from_json_str(&content, prefix)
            .with_context(|| format!("failed to parse roster: {}", path.display()))
    }

    /// Parse roster JSON, normalizing ids and gender codes.
    ///
    /// Records with a blank id are dropped; unknown gender codes are kept as
    /// `None` so gender-conditional instruments are treated as inapplicable.
    pub fn from_json_str(content: &str, prefix: &str) -> Result<Self> {
        let records: Vec<RosterRecord> = serde_json::from_str(content)?;
        let mut test_takers = Vec::with_capacity(records.len());
        for record in records {
            let Some(id) = TestTakerId::normalize(&record.id, prefix) else {
                tracing::warn!("roster record with blank id skipped");
                continue;
            };
            let gender = match record.gender.as_deref() {
                Some(raw) if !raw.trim().is_empty() => match raw.parse::<Gender>() {
                    Ok(g) => Some(g),
                    Err(e) => {
                        tracing::warn!("roster record {id}: {e}");
                        None
                    }
                },
                _ => None,
            };
            test_takers.push(TestTaker {
                id,
                name: record.name,
                gender,
                class_id: record.class_id,
                school_id: record.school_id,
            });
        }
        Ok(Self { test_takers })
    }

    pub fn get(&self, id: &TestTakerId) -> Option<&TestTaker> {
        self.test_takers.iter().find(|t| &t.id == id)
    }

    pub fn len(&self) -> usize {
        self.test_takers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_takers.is_empty()
    }
}

/// A merged field value with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedAnswer {
    pub value: String,
    /// The submission that contributed this value.
    pub submission_id: String,
    pub source: SourceTag,
}

/// One authoritative answer per field for one test-taker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalAnswerSet {
    fields: BTreeMap<String, MergedAnswer>,
}

impl CanonicalAnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&MergedAnswer> {
        self.fields.get(field)
    }

    /// The merged value for `field`, if answered.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|a| a.value.as_str())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MergedAnswer)> {
        self.fields.iter()
    }

    /// First write wins; returns `false` if the field was already set.
    pub(crate) fn insert_if_absent(&mut self, field: &str, answer: MergedAnswer) -> bool {
        if self.fields.contains_key(field) {
            return false;
        }
        self.fields.insert(field.to_string(), answer);
        true
    }
}

impl FromIterator<(String, MergedAnswer)> for CanonicalAnswerSet {
    fn from_iter<I: IntoIterator<Item = (String, MergedAnswer)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (field, answer) in iter {
            set.insert_if_absent(&field, answer);
        }
        set
    }
}
