use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::identity::Identity;

/// Maximum number of failed attempts kept on a record.
pub const MAX_FAILURE_HISTORY: usize = 16;

/// A file seen in the watch directory that may be ready for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCandidate {
    pub source_path: PathBuf,
    pub detected_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    pub stability_confirmed: bool,
}

/// A candidate is keyed by path, mtime and size; a replaced file is a new candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
}

impl ExportCandidate {
    pub fn new(source_path: PathBuf, size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            source_path,
            detected_at: Utc::now(),
            modified_at,
            size,
            stability_confirmed: false,
        }
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.source_path)
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            path: self.source_path.clone(),
            modified_at: self.modified_at,
            size: self.size,
        }
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Lifecycle of an [`IngestionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Claimed, content not yet in the store.
    Pending,
    /// Copied and verified under the storage root, not yet acknowledged.
    Stored,
    /// Remote API acknowledged it. Terminal.
    Acknowledged,
    /// Gave up: attempt ceiling reached or permanent rejection. Terminal.
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Stored => "stored",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }
}

/// One failed step, kept for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    /// Delay applied before the next attempt, if any.
    pub backoff_ms: Option<u64>,
    pub at: DateTime<Utc>,
}

/// Durable state of one content identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub candidate_id: Identity,
    pub original_name: String,
    pub source_path: PathBuf,
    pub stored_path: Option<PathBuf>,
    pub size: u64,
    pub status: RecordStatus,
    pub remote_ack: bool,
    /// Identifier returned by the API, when it sends one.
    pub remote_id: Option<String>,
    /// Remote notification attempts made so far, across restarts.
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    #[serde(default)]
    pub failures: Vec<AttemptFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
}

impl IngestionRecord {
    pub fn new(candidate_id: Identity, candidate: &ExportCandidate, size: u64) -> Self {
        let now = Utc::now();
        Self {
            candidate_id,
            original_name: candidate.file_name(),
            source_path: candidate.source_path.clone(),
            stored_path: None,
            size,
            status: RecordStatus::Pending,
            remote_ack: false,
            remote_id: None,
            attempts: 0,
            last_error: None,
            last_error_message: None,
            failures: Vec::new(),
            created_at: now,
            updated_at: now,
            acked_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.remote_ack || self.status == RecordStatus::Failed
    }

    /// Point the record at a newer sighting of the same content.
    pub fn observe_source(&mut self, candidate: &ExportCandidate) {
        self.source_path = candidate.source_path.clone();
        self.original_name = candidate.file_name();
        self.updated_at = Utc::now();
    }

    pub fn mark_stored(&mut self, stored_path: PathBuf) {
        self.stored_path = Some(stored_path);
        if self.status == RecordStatus::Pending {
            self.status = RecordStatus::Stored;
        }
        self.updated_at = Utc::now();
    }

    /// Count a remote notification attempt before it is made.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.updated_at = Utc::now();
        self.attempts
    }

    pub fn record_failure(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        backoff_ms: Option<u64>,
    ) {
        let message = message.into();
        self.last_error = Some(kind);
        self.last_error_message = Some(message.clone());
        self.failures.push(AttemptFailure {
            attempt: self.attempts,
            kind,
            message,
            backoff_ms,
            at: Utc::now(),
        });
        if self.failures.len() > MAX_FAILURE_HISTORY {
            let excess = self.failures.len() - MAX_FAILURE_HISTORY;
            self.failures.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_acknowledged(&mut self, remote_id: Option<String>) {
        let now = Utc::now();
        self.remote_ack = true;
        self.remote_id = remote_id;
        self.status = RecordStatus::Acknowledged;
        self.acked_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.status = RecordStatus::Failed;
        self.last_error = Some(kind);
        self.last_error_message = Some(message.into());
        self.updated_at = Utc::now();
    }
}
