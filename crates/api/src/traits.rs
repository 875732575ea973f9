//! IngestApi trait definition and shared request/error types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use intake_core::{ErrorKind, Identity};

/// Errors that can occur talking to the remote API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential rejected with status {status}")]
    Auth { status: u16 },

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Map onto the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) if e.is_builder() => ErrorKind::Config,
            Self::Http(_) | Self::RateLimited { .. } | Self::Server { .. } => {
                ErrorKind::TransientNetwork
            }
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Rejected { .. } => ErrorKind::PermanentValidation,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-requested delay, when it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status } | Self::Server { status, .. } | Self::Rejected { status, .. } => {
                Some(*status)
            }
            Self::RateLimited { .. } => Some(429),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Config(_) => None,
        }
    }
}

/// Positive acknowledgment of an ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
    /// Identifier the API assigned, when the response carried one.
    pub remote_id: Option<String>,
}

/// Descriptive fields sent alongside an ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeMetadata {
    pub original_name: String,
    pub size: u64,
    pub mime: String,
    pub source_path: String,
    pub detected_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
}

/// Body of `POST {API_BASE}/ingestions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionNotice {
    pub identity: Identity,
    pub stored_path: String,
    pub metadata: NoticeMetadata,
}

impl IngestionNotice {
    pub fn with_attempt(&self, attempt: u32) -> Self {
        let mut notice = self.clone();
        notice.metadata.attempt = attempt;
        notice
    }
}

/// Pipeline stage reported through [`IngestEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
    Received,
    Stored,
    Acknowledged,
    Archived,
    Duplicate,
    Error,
}

impl EventStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Stored => "stored",
            Self::Acknowledged => "acknowledged",
            Self::Archived => "archived",
            Self::Duplicate => "duplicate",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST {API_BASE}/ingest/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEvent {
    pub identity: Option<Identity>,
    pub stage: EventStage,
    pub message: String,
    pub meta: serde_json::Value,
}

/// The remote ingestion service.
#[async_trait::async_trait]
pub trait IngestApi: Send + Sync {
    /// Register one stored artifact. Must be idempotent per identity.
    async fn notify(&self, notice: &IngestionNotice) -> Result<Ack, ApiError>;

    /// Record a pipeline stage event. Best effort.
    async fn report_event(&self, event: &IngestEvent) -> Result<(), ApiError> {
        let _ = event;
        Ok(())
    }

    /// Human-readable target, for logs.
    fn endpoint(&self) -> &str;
}
