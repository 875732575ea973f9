//! Authenticated reqwest client for the remote ingestion API.
//!
//! Every request carries `Authorization: Bearer {WORKER_JWT}`. Ingestion
//! notices also carry `Idempotency-Key: {identity}` so the server can
//! collapse re-deliveries of the same content.

use std::time::Duration;

use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use url::Url;

use intake_core::{Credential, Settings};

use crate::traits::{Ack, ApiError, IngestApi, IngestEvent, IngestionNotice};

/// Header carrying the content identity on ingestion notices.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

const USER_AGENT: &str = concat!("export-intake/", env!("CARGO_PKG_VERSION"));

/// Maximum response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for `{API_BASE}`.
pub struct ApiClient {
    ingestions_url: Url,
    events_url: Url,
    health_url: Url,
    credential: Credential,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl ApiClient {
    /// Build a client for `base`. Endpoints are resolved eagerly.
    pub fn new(base: &Url, credential: Credential, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            ingestions_url: endpoint(base, "ingestions")?,
            events_url: endpoint(base, "ingest/events")?,
            health_url: endpoint(base, "ingest/health")?,
            credential,
            client,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ApiError> {
        Self::new(
            settings.api_base(),
            settings.credential().clone(),
            settings.retry().request_timeout,
        )
    }

    /// Probe `GET {API_BASE}/ingest/health`.
    ///
    /// Only an auth rejection is meaningful to callers; other failures are
    /// returned so they can be logged.
    pub async fn health(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .get(self.health_url.clone())
            .bearer_auth(self.credential.expose())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = retry_after_secs(response.headers().get(RETRY_AFTER));
        let body = read_body(response).await;
        Err(classify_failure(status, retry_after, body))
    }
}

#[async_trait::async_trait]
impl IngestApi for ApiClient {
    async fn notify(&self, notice: &IngestionNotice) -> Result<Ack, ApiError> {
        let response = self
            .client
            .post(self.ingestions_url.clone())
            .bearer_auth(self.credential.expose())
            .header(IDEMPOTENCY_KEY, notice.identity.as_str())
            .json(notice)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers().get(RETRY_AFTER));
            let body = read_body(response).await;
            tracing::warn!(
                url = %self.ingestions_url,
                identity = %notice.identity.short(),
                %status,
                body = %body,
                "ingestion notice not accepted"
            );
            return Err(classify_failure(status, retry_after, body));
        }

        let body = read_body(response).await;
        let remote_id = parse_remote_id(&body);

        tracing::debug!(
            url = %self.ingestions_url,
            identity = %notice.identity.short(),
            %status,
            remote_id = remote_id.as_deref().unwrap_or("-"),
            "ingestion acknowledged"
        );

        Ok(Ack {
            status: status.as_u16(),
            remote_id,
        })
    }

    async fn report_event(&self, event: &IngestEvent) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.events_url.clone())
            .bearer_auth(self.credential.expose())
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = retry_after_secs(response.headers().get(RETRY_AFTER));
        let body = read_body(response).await;
        Err(classify_failure(status, retry_after, body))
    }

    fn endpoint(&self) -> &str {
        self.ingestions_url.as_str()
    }
}

/// Append `path` to the base URL, keeping every base path segment.
///
/// `Url::join` would drop the last segment of `http://host/api`, so the
/// join is done on the string form.
fn endpoint(base: &Url, path: &str) -> Result<Url, ApiError> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| ApiError::Config(format!("invalid endpoint {joined}: {e}")))
}

/// Map a non-2xx status onto an [`ApiError`].
pub(crate) fn classify_failure(status: StatusCode, retry_after: Option<u64>, body: String) -> ApiError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth { status: code },
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited {
            retry_after_secs: retry_after,
        },
        s if s.is_server_error() => ApiError::Server { status: code, body },
        _ => ApiError::Rejected { status: code, body },
    }
}

fn retry_after_secs(value: Option<&HeaderValue>) -> Option<u64> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn read_body(response: reqwest::Response) -> String {
    let mut body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Pull `id` out of a JSON ack body; strings and numbers are both accepted.
fn parse_remote_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path() {
        let base = Url::parse("http://localhost:4000/api").unwrap();
        assert_eq!(
            endpoint(&base, "ingestions").unwrap().as_str(),
            "http://localhost:4000/api/ingestions"
        );
        let slashed = Url::parse("http://localhost:4000/api/").unwrap();
        assert_eq!(
            endpoint(&slashed, "ingest/events").unwrap().as_str(),
            "http://localhost:4000/api/ingest/events"
        );
    }

    #[test]
    fn classify_auth_rate_limit_server_and_rejection() {
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, None, String::new()),
            ApiError::Auth { status: 401 }
        ));
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, None, String::new()),
            ApiError::Auth { status: 403 }
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, Some(4), String::new()),
            ApiError::RateLimited { retry_after_secs: Some(4) }
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, "down".into()),
            ApiError::Server { status: 502, .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, None, "bad".into()),
            ApiError::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn remote_id_from_string_or_number() {
        assert_eq!(parse_remote_id(r#"{"id":"doc-9"}"#).as_deref(), Some("doc-9"));
        assert_eq!(parse_remote_id(r#"{"id":42}"#).as_deref(), Some("42"));
        assert_eq!(parse_remote_id(r#"{"ok":true}"#), None);
        assert_eq!(parse_remote_id(""), None);
    }

    #[test]
    fn retry_after_header_parsing() {
        assert_eq!(retry_after_secs(Some(&HeaderValue::from_static("12"))), Some(12));
        assert_eq!(
            retry_after_secs(Some(&HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"))),
            None
        );
        assert_eq!(retry_after_secs(None), None);
    }
}
