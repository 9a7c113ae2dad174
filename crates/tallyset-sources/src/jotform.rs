//! JotForm submissions client (primary source).
//!
//! Besides the paged feed, the client can look up the submissions of a
//! single identity and list the form's questions as a name → question id
//! map.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use tallyset_core::error::{FetchError, MergeError};
use tallyset_core::model::{AnswerTriple, RawSubmission, SourceTag};
use tallyset_core::traits::{Page, PageRequest, PageSource, SortDirection};

use crate::error::{classify_transport, read_json};

pub const DEFAULT_BASE_URL: &str = "https://api.jotform.com";
const JOTFORM_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";
/// Page size for identity lookups, both filtered and scanned.
const LOOKUP_PAGE: usize = 1000;

/// Answer-field name → JotForm question id.
pub type QuestionMap = BTreeMap<String, String>;

/// Paged access to one JotForm form's submissions.
pub struct JotformClient {
    api_key: String,
    form_id: String,
    base_url: String,
    timeout_secs: u64,
    /// Offset of the account timezone `created_at` values are written in.
    utc_offset: FixedOffset,
    client: reqwest::Client,
}

impl JotformClient {
    pub fn new(
        api_key: &str,
        form_id: &str,
        base_url: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.to_string(),
            form_id: form_id.to_string(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs: timeout.as_secs(),
            utc_offset: Utc.fix(),
            client,
        })
    }

    /// Read naive `created_at` values as wall-clock time at `offset`.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    fn endpoint(&self, resource: &str, params: &[(&str, &str)]) -> Result<reqwest::Url, FetchError> {
        let mut query = vec![("apiKey", self.api_key.as_str())];
        query.extend_from_slice(params);
        reqwest::Url::parse_with_params(
            &format!("{}/form/{}/{resource}", self.base_url, self.form_id),
            &query,
        )
        .map_err(|e| FetchError::Api {
            status: 0,
            message: format!("invalid JotForm URL: {e}"),
        })
    }

    fn page_url(&self, request: &PageRequest, filter: Option<&str>) -> Result<reqwest::Url, FetchError> {
        let direction = match request.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        let limit = request.limit.to_string();
        let offset = request.offset.to_string();
        let mut params = vec![
            ("limit", limit.as_str()),
            ("offset", offset.as_str()),
            ("orderby", request.order_by.as_str()),
            ("direction", direction),
        ];
        if let Some(filter) = filter {
            params.push(("filter", filter));
        }
        self.endpoint("submissions", &params)
    }

    async fn get_page(&self, url: reqwest::Url) -> Result<Page, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout_secs))?;
        let page: SubmissionsPage = read_json(response, self.timeout_secs).await?;

        let mut out = Page::default();
        for record in page.content {
            match decode_submission(record, self.utc_offset) {
                Ok(submission) => out.submissions.push(submission),
                Err(e) => {
                    tracing::warn!("skipping JotForm record: {e}");
                    out.skipped.push(e);
                }
            }
        }
        Ok(out)
    }

    /// The form's questions as a name → question id map.
    ///
    /// Questions without a `name` are keyed by their label text; the
    /// question id falls back to the key JotForm lists the question under.
    #[instrument(skip(self), fields(form_id = %self.form_id))]
    pub async fn fetch_questions(&self) -> Result<QuestionMap, FetchError> {
        let url = self.endpoint("questions", &[])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout_secs))?;
        let body: QuestionsResponse = read_json(response, self.timeout_secs).await?;

        let mut map = QuestionMap::new();
        for (key, raw) in body.content {
            let Ok(question) = serde_json::from_value::<WireQuestion>(raw) else {
                continue;
            };
            let name = [question.name, question.text]
                .into_iter()
                .flatten()
                .map(|n| n.trim().to_string())
                .find(|n| !n.is_empty());
            let qid = question
                .qid
                .as_ref()
                .and_then(scalar_text)
                .filter(|q| !q.is_empty())
                .unwrap_or(key);
            if let Some(name) = name {
                map.insert(name, qid);
            }
        }
        tracing::info!(questions = map.len(), "JotForm questions fetched");
        Ok(map)
    }

    /// Submissions whose answer to question `qid` satisfies `matches`,
    /// oldest first.
    ///
    /// Asks the server-side filter for `qid == value` first. When that
    /// request fails or returns nothing that `matches` accepts, every page
    /// is scanned instead. `matches` sees the answer with runs of
    /// whitespace collapsed.
    #[instrument(skip(self, matches), fields(form_id = %self.form_id))]
    pub async fn find_submissions<F>(
        &self,
        qid: &str,
        value: &str,
        matches: F,
    ) -> Result<Vec<RawSubmission>, FetchError>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        let mut filter = serde_json::Map::new();
        filter.insert(format!("{qid}:eq"), Value::String(value.to_string()));
        let filter = Value::Object(filter).to_string();

        let filtered = match self.page_url(&lookup_request(0), Some(&filter)) {
            Ok(url) => self.get_page(url).await,
            Err(e) => Err(e),
        };
        match filtered {
            Ok(page) => {
                let found = keep_matching(page.submissions, qid, &matches);
                if !found.is_empty() {
                    tracing::debug!(found = found.len(), "identity found via filter");
                    return Ok(found);
                }
                tracing::debug!("filter returned no exact match, scanning pages");
            }
            Err(e) => tracing::warn!("filter lookup failed, scanning pages: {e}"),
        }

        let mut found = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.get_page(self.page_url(&lookup_request(offset), None)?).await?;
            let received = page.received();
            found.extend(keep_matching(page.submissions, qid, &matches));
            if received < LOOKUP_PAGE {
                break;
            }
            offset += received;
        }
        tracing::debug!(found = found.len(), scanned = offset, "identity scan finished");
        Ok(found)
    }
}

fn lookup_request(offset: usize) -> PageRequest {
    PageRequest {
        offset,
        limit: LOOKUP_PAGE,
        order_by: "created_at".to_string(),
        direction: SortDirection::Asc,
    }
}

fn keep_matching<F>(submissions: Vec<RawSubmission>, qid: &str, matches: &F) -> Vec<RawSubmission>
where
    F: Fn(&str) -> bool,
{
    submissions
        .into_iter()
        .filter(|s| {
            s.answers.iter().any(|a| {
                a.question_id == qid
                    && matches(&a.value.split_whitespace().collect::<Vec<_>>().join(" "))
            })
        })
        .collect()
}

/// Write a question map as pretty JSON, creating parent directories.
pub fn write_question_map(path: &Path, map: &QuestionMap) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(map).context("failed to serialize question map")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write question map: {}", path.display()))
}

pub fn load_question_map(path: &Path) -> anyhow::Result<QuestionMap> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read question map: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse question map: {}", path.display()))
}

/// Parse a `+HH:MM` / `-HH:MM` UTC offset.
pub fn parse_utc_offset(raw: &str) -> anyhow::Result<FixedOffset> {
    raw.trim()
        .parse::<FixedOffset>()
        .map_err(|e| anyhow::anyhow!("invalid UTC offset '{raw}': {e}"))
}

#[derive(Deserialize)]
struct SubmissionsPage {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Deserialize)]
struct WireSubmission {
    id: Value,
    created_at: String,
    #[serde(default)]
    answers: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct QuestionsResponse {
    #[serde(default)]
    content: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct WireQuestion {
    #[serde(default)]
    qid: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireAnswer {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    answer: Option<Value>,
}

#[async_trait]
impl PageSource for JotformClient {
    fn name(&self) -> &str {
        "jotform"
    }

    fn source_tag(&self) -> SourceTag {
        SourceTag::Primary
    }

    #[instrument(skip(self, request), fields(form_id = %self.form_id, offset = request.offset, limit = request.limit))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        self.get_page(self.page_url(request, None)?).await
    }
}

fn decode_submission(record: Value, utc_offset: FixedOffset) -> Result<RawSubmission, MergeError> {
    let malformed = |reason: String| MergeError::MalformedRecord {
        origin: SourceTag::Primary,
        reason,
    };
    let wire: WireSubmission =
        serde_json::from_value(record).map_err(|e| malformed(e.to_string()))?;
    let id = scalar_text(&wire.id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("submission without id".to_string()))?;
    let created_at = parse_local_timestamp(&wire.created_at, utc_offset)
        .ok_or_else(|| malformed(format!("submission {id}: bad created_at {:?}", wire.created_at)))?;

    let mut answers = Vec::with_capacity(wire.answers.len());
    for (qid, raw) in wire.answers {
        let Ok(answer) = serde_json::from_value::<WireAnswer>(raw) else {
            tracing::debug!(submission = %id, question = %qid, "non-object answer ignored");
            continue;
        };
        let Some(value) = answer.answer.as_ref().and_then(answer_text) else {
            continue;
        };
        answers.push(AnswerTriple {
            question_id: qid,
            value,
            field_name: answer.name.filter(|n| !n.trim().is_empty()),
        });
    }

    Ok(RawSubmission {
        id,
        created_at,
        source: SourceTag::Primary,
        answers,
    })
}

/// Accepts `YYYY-MM-DD HH:MM:SS` (taken as UTC) or RFC 3339.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_local_timestamp(raw, Utc.fix())
}

/// Like [`parse_timestamp`], but naive values are wall-clock time at
/// `utc_offset`. RFC 3339 values keep their own offset.
pub(crate) fn parse_local_timestamp(raw: &str, utc_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, JOTFORM_TIMESTAMP) {
        return naive
            .and_local_timezone(utc_offset)
            .single()
            .map(|dt| dt.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Flatten an answer value to text. Lists join with ", ", compound answers
/// (name or address widgets) join their parts with a space.
pub(crate) fn answer_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Array(items) => items
            .iter()
            .filter_map(answer_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(parts) => parts
            .values()
            .filter_map(answer_text)
            .collect::<Vec<_>>()
            .join(" "),
        other => scalar_text(other)?,
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> JotformClient {
        JotformClient::new("test-key", "2412", Some(server.uri()), Duration::from_secs(5)).unwrap()
    }

    fn request(offset: usize, limit: usize) -> PageRequest {
        PageRequest {
            offset,
            limit,
            order_by: "created_at".into(),
            direction: SortDirection::Asc,
        }
    }

    #[tokio::test]
    async fn decodes_page_and_sends_paging_params() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "responseCode": 200,
            "content": [
                {
                    "id": "5901",
                    "created_at": "2025-03-04 08:15:00",
                    "answers": {
                        "3": {"name": "student-id", "answer": "C10001", "type": "control_textbox"},
                        "4": {"name": "ERV_Q1", "answer": "2"},
                        "5": {"name": "child-name", "answer": {"first": "Ada", "last": "Ng"}},
                        "6": {"name": "ERV_Q2", "answer": ""},
                        "7": {"text": "Section header"}
                    }
                },
                {"id": "5902", "created_at": "not a date", "answers": {}}
            ],
            "resultSet": {"offset": 0, "limit": 100, "count": 2}
        });

        Mock::given(method("GET"))
            .and(path("/form/2412/submissions"))
            .and(query_param("apiKey", "test-key"))
            .and(query_param("limit", "100"))
            .and(query_param("offset", "200"))
            .and(query_param("orderby", "created_at"))
            .and(query_param("direction", "ASC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let page = client(&server).fetch_page(&request(200, 100)).await.unwrap();
        assert_eq!(page.submissions.len(), 1);
        assert_eq!(page.skipped.len(), 1);
        assert_eq!(page.received(), 2);

        let s = &page.submissions[0];
        assert_eq!(s.id, "5901");
        assert_eq!(s.created_at.to_rfc3339(), "2025-03-04T08:15:00+00:00");
        let named: Vec<_> = s
            .answers
            .iter()
            .map(|a| (a.field_name.as_deref().unwrap_or(""), a.value.as_str()))
            .collect();
        assert!(named.contains(&("student-id", "C10001")));
        assert!(named.contains(&("ERV_Q1", "2")));
        assert!(named.contains(&("child-name", "Ada Ng")));
        assert!(!named.iter().any(|(f, _)| *f == "ERV_Q2"));
    }

    #[tokio::test]
    async fn gateway_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(504).set_body_string("<html>Gateway Timeout</html>"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_page(&request(0, 100)).await.unwrap_err();
        assert_eq!(err, FetchError::Gateway { status: 504 });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn html_with_success_status_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<!DOCTYPE html><html>"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_page(&request(0, 100)).await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedBody(_)));
    }

    #[tokio::test]
    async fn authentication_failure_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"message\":\"You're not authorized\"}"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_page(&request(0, 100)).await.unwrap_err();
        assert!(matches!(err, FetchError::AuthenticationFailed(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn rate_limit_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "60"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_page(&request(0, 100)).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::RateLimited {
                retry_after_secs: Some(60)
            }
        );
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"content": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client =
            JotformClient::new("k", "1", Some(server.uri()), Duration::from_millis(200)).unwrap();
        let err = client.fetch_page(&request(0, 10)).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    fn record(id: &str, created_at: &str, student: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "created_at": created_at,
            "answers": {
                "3": {"name": "student-id", "answer": student},
                "4": {"name": "ERV_Q1", "answer": "1"}
            }
        })
    }

    /// Scan requests carry no `filter`; mounted after the filter mock so
    /// filtered requests never reach it.
    async fn mount_scan(server: &MockServer, content: serde_json::Value, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/form/2412/submissions"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "content": content })))
            .expect(expected)
            .mount(server)
            .await;
    }

    fn exact(candidate: &str) -> bool {
        candidate == "C10001"
    }

    #[tokio::test]
    async fn lookup_served_by_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/form/2412/submissions"))
            .and(query_param("filter", r#"{"3:eq":"C10001"}"#))
            .and(query_param("orderby", "created_at"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    record("5901", "2025-03-04 08:15:00", "C10001"),
                    record("5905", "2025-03-05 08:15:00", "C100011")
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_scan(&server, serde_json::json!([]), 0).await;

        let found = client(&server)
            .find_submissions("3", "C10001", exact)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["5901"]);
    }

    #[tokio::test]
    async fn lookup_scans_when_filter_has_no_exact_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("filter", r#"{"3:eq":"C10001"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [record("5905", "2025-03-05 08:15:00", "C100011")]
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_scan(
            &server,
            serde_json::json!([
                record("5901", "2025-03-04 08:15:00", "  C10001 "),
                record("5902", "2025-03-04 09:00:00", "C10002"),
                record("5903", "2025-03-06 10:00:00", "C10001")
            ]),
            1,
        )
        .await;

        let found = client(&server)
            .find_submissions("3", "C10001", exact)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["5901", "5903"]);
    }

    #[tokio::test]
    async fn lookup_scans_when_filter_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("filter", r#"{"3:eq":"10001"}"#))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;
        mount_scan(
            &server,
            serde_json::json!([record("5901", "2025-03-04 08:15:00", "C10001")]),
            1,
        )
        .await;

        // the typed id lacks the prefix, the stored answer has it
        let found = client(&server)
            .find_submissions("3", "10001", |c| c.trim_start_matches('C') == "10001")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn lookup_scan_propagates_terminal_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server)
            .find_submissions("3", "C10001", exact)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn question_map_from_questions_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/form/2412/questions"))
            .and(query_param("apiKey", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": {
                    "3": {"qid": "3", "name": "student-id", "text": "Student ID", "type": "control_textbox"},
                    "4": {"qid": 4, "name": "ERV_Q1"},
                    "7": {"text": "Section header"},
                    "8": {"type": "control_button"}
                }
            })))
            .mount(&server)
            .await;

        let map = client(&server).fetch_questions().await.unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["student-id"], "3");
        assert_eq!(map["ERV_Q1"], "4");
        assert_eq!(map["Section header"], "7");

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("assets").join("jotform-questions.json");
        write_question_map(&file, &map).unwrap();
        assert_eq!(load_question_map(&file).unwrap(), map);
    }

    #[tokio::test]
    async fn naive_timestamps_use_the_account_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [record("5901", "2025-03-04 08:15:00", "C10001")]
            })))
            .mount(&server)
            .await;

        let client = client(&server).with_utc_offset(parse_utc_offset("+08:00").unwrap());
        let page = client.fetch_page(&request(0, 100)).await.unwrap();
        assert_eq!(
            page.submissions[0].created_at.to_rfc3339(),
            "2025-03-04T00:15:00+00:00"
        );
    }

    #[test]
    fn utc_offsets() {
        let offset = parse_utc_offset("-05:00").unwrap();
        assert_eq!(offset.local_minus_utc(), -5 * 3600);
        assert!(parse_utc_offset("8h").is_err());

        let at = parse_local_timestamp("2025-03-04T08:15:00+02:00", offset).unwrap();
        assert_eq!(at.to_rfc3339(), "2025-03-04T06:15:00+00:00");
    }

    #[test]
    fn answer_flattening() {
        assert_eq!(answer_text(&serde_json::json!(["a", "b"])).as_deref(), Some("a, b"));
        assert_eq!(answer_text(&serde_json::json!(3)).as_deref(), Some("3"));
        assert_eq!(answer_text(&serde_json::json!("  ")), None);
        assert_eq!(answer_text(&serde_json::json!(null)), None);
    }
}
