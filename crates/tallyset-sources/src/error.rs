//! HTTP failure classification shared by the source clients.

use serde::de::DeserializeOwned;

use tallyset_core::error::FetchError;

/// Longest body excerpt carried in an error message.
const BODY_EXCERPT: usize = 200;

/// Map a non-success HTTP status to a fetch error.
pub fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> FetchError {
    match status {
        401 | 403 => FetchError::AuthenticationFailed(excerpt(body)),
        429 => FetchError::RateLimited { retry_after_secs },
        500 | 502 | 503 | 504 => FetchError::Gateway { status },
        _ => FetchError::Api {
            status,
            message: excerpt(body),
        },
    }
}

/// Map a transport-level failure to a fetch error.
pub fn classify_transport(err: &reqwest::Error, timeout_secs: u64) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout_secs)
    } else if err.is_body() || err.is_decode() {
        FetchError::MalformedBody(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Check the status, then decode the body as JSON.
///
/// Error pages served with a success status (HTML from a proxy, truncated
/// JSON) surface as [`FetchError::MalformedBody`].
pub async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    timeout_secs: u64,
) -> Result<T, FetchError> {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response
        .text()
        .await
        .map_err(|e| classify_transport(&e, timeout_secs))?;

    if status >= 400 {
        return Err(classify_status(status, retry_after, &body));
    }

    serde_json::from_str(&body).map_err(|e| {
        FetchError::MalformedBody(format!("{e} (body starts {:?})", excerpt(&body)))
    })
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
