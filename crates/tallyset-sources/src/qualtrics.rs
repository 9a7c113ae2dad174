//! Qualtrics response export client (secondary source).
//!
//! Qualtrics serves responses through an asynchronous export job rather than
//! pages: start the export, poll it to completion, then download the file.
//! A transient failure anywhere in the job restarts the whole export.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use tallyset_core::error::{FetchError, MergeError};
use tallyset_core::model::{AnswerTriple, RawSubmission, SourceTag};
use tallyset_core::progress::{CancellationFlag, Phase, ProgressObserver, ProgressTracker};
use tallyset_core::traits::{FetchOutcome, SubmissionFeed};

use crate::error::{classify_transport, read_json};
use crate::jotform::{answer_text, parse_timestamp};

pub const DEFAULT_BASE_URL: &str = "https://syd1.qualtrics.com";

/// Response metadata that is not an answer.
const METADATA_KEYS: &[&str] = &[
    "recordedDate",
    "startDate",
    "endDate",
    "status",
    "ipAddress",
    "progress",
    "duration",
    "finished",
    "locationLatitude",
    "locationLongitude",
    "distributionChannel",
    "userLanguage",
];

/// Polling and retry limits for one export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportPolicy {
    #[serde(with = "millis", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    pub max_polls: u32,
    /// Whole-export attempts before a transient failure becomes final.
    pub max_attempts: u32,
    #[serde(with = "millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
}

impl Default for ExportPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_polls: 60,
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub struct QualtricsClient {
    api_token: String,
    survey_id: String,
    base_url: String,
    timeout_secs: u64,
    policy: ExportPolicy,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResult {
    progress_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressResult {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    percent_complete: f64,
    #[serde(default)]
    file_id: Option<String>,
}

#[derive(Deserialize)]
struct ExportFile {
    #[serde(default)]
    responses: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    response_id: String,
    #[serde(default)]
    values: serde_json::Map<String, Value>,
}

impl QualtricsClient {
    pub fn new(
        api_token: &str,
        survey_id: &str,
        base_url: Option<String>,
        timeout: Duration,
        policy: ExportPolicy,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(policy.max_attempts >= 1, "max_attempts must be at least 1");
        anyhow::ensure!(policy.max_polls >= 1, "max_polls must be at least 1");
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_token: api_token.to_string(),
            survey_id: survey_id.to_string(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs: timeout.as_secs(),
            policy,
            client,
        })
    }

    fn exports_url(&self) -> String {
        format!(
            "{}/API/v3/surveys/{}/export-responses",
            self.base_url, self.survey_id
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, FetchError> {
        request
            .header("X-API-TOKEN", &self.api_token)
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout_secs))
    }

    #[instrument(skip(self), fields(survey_id = %self.survey_id))]
    async fn start_export(&self) -> Result<String, FetchError> {
        let request = self
            .client
            .post(self.exports_url())
            .json(&serde_json::json!({ "format": "json", "compress": false }));
        let response = self.send(request).await?;
        let envelope: Envelope<StartResult> = read_json(response, self.timeout_secs).await?;
        Ok(envelope.result.progress_id)
    }

    async fn poll_export(
        &self,
        progress_id: &str,
        tracker: &ProgressTracker,
        cancel: &CancellationFlag,
    ) -> Result<String, FetchError> {
        let url = format!("{}/{}", self.exports_url(), progress_id);
        for poll in 0..self.policy.max_polls {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let response = self.send(self.client.get(&url)).await?;
            let envelope: Envelope<ProgressResult> =
                read_json(response, self.timeout_secs).await?;
            let progress = envelope.result;

            // The download still follows, so polling covers 0..90.
            let pct = (progress.percent_complete.clamp(0.0, 100.0) * 0.9) as u8;
            tracker.report(pct, "exporting responses");

            match progress.status.as_deref() {
                Some("complete") => {
                    return progress.file_id.ok_or_else(|| {
                        FetchError::MalformedBody("export complete without fileId".to_string())
                    });
                }
                Some("failed") => {
                    return Err(FetchError::ExportFailed(format!(
                        "export {progress_id} reported failure"
                    )));
                }
                Some("inProgress") | None => {
                    tracing::debug!(poll, percent = progress.percent_complete, "export in progress");
                }
                Some(other) => {
                    return Err(FetchError::ExportFailed(format!(
                        "unexpected export status '{other}'"
                    )));
                }
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
        let waited = self.policy.poll_interval.as_secs() * u64::from(self.policy.max_polls);
        tracing::warn!(progress_id, "export did not complete after {} polls", self.policy.max_polls);
        Err(FetchError::Timeout(waited))
    }

    #[instrument(skip(self), fields(survey_id = %self.survey_id))]
    async fn download(&self, file_id: &str) -> Result<FetchOutcome, FetchError> {
        let url = format!("{}/{}/file", self.exports_url(), file_id);
        let response = self.send(self.client.get(&url)).await?;
        let file: ExportFile = read_json(response, self.timeout_secs).await?;

        let mut outcome = FetchOutcome::default();
        for record in file.responses {
            match decode_response(record) {
                Ok(submission) => outcome.submissions.push(submission),
                Err(e) => {
                    tracing::warn!("skipping Qualtrics response: {e}");
                    outcome.skipped.push(e);
                }
            }
        }
        Ok(outcome)
    }

    async fn export_once(
        &self,
        tracker: &ProgressTracker,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError> {
        let progress_id = self.start_export().await?;
        let file_id = self.poll_export(&progress_id, tracker, cancel).await?;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.download(&file_id).await
    }

    /// Run the export, restarting it on transient failures.
    pub async fn export(
        &self,
        tracker: &ProgressTracker,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError> {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self.export_once(tracker, cancel).await {
                Ok(outcome) => {
                    tracker.finish("secondary export complete");
                    tracing::info!(
                        records = outcome.submissions.len(),
                        skipped = outcome.skipped.len(),
                        attempt,
                        "qualtrics export complete"
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    tracing::warn!(attempt, "qualtrics export failed, restarting: {e}");
                    attempt += 1;
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(attempt, "qualtrics export failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl SubmissionFeed for QualtricsClient {
    async fn fetch_all(
        &self,
        observer: Arc<dyn ProgressObserver>,
        cancel: &CancellationFlag,
    ) -> Result<FetchOutcome, FetchError> {
        let tracker = ProgressTracker::new(observer, Phase::FetchSecondary);
        self.export(&tracker, cancel).await
    }
}

fn decode_response(record: Value) -> Result<RawSubmission, MergeError> {
    let malformed = |reason: String| MergeError::MalformedRecord {
        origin: SourceTag::Secondary,
        reason,
    };
    let wire: WireResponse =
        serde_json::from_value(record).map_err(|e| malformed(e.to_string()))?;
    let id = wire.response_id.trim().to_string();
    if id.is_empty() {
        return Err(malformed("response without responseId".to_string()));
    }
    let created_at = ["recordedDate", "startDate"]
        .iter()
        .filter_map(|key| wire.values.get(*key).and_then(Value::as_str))
        .find_map(parse_timestamp)
        .ok_or_else(|| malformed(format!("response {id}: no usable recordedDate or startDate")))?;

    let answers = wire
        .values
        .iter()
        .filter(|(key, _)| !METADATA_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| {
            answer_text(value).map(|text| AnswerTriple::encoded(key, &text))
        })
        .collect();

    Ok(RawSubmission {
        id,
        created_at,
        source: SourceTag::Secondary,
        answers,
    })
}
