use intake_core::{ErrorKind, Identity};
use thiserror::Error;

/// Errors produced by [`IngestionIndex`](super::IngestionIndex) operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no record for identity {0}")]
    NotFound(Identity),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::TransientIo,
            Self::Json(_) | Self::NotFound(_) => ErrorKind::PermanentValidation,
        }
    }
}

/// File name of the record for an identity.
pub(super) fn record_filename(identity: &Identity) -> String {
    format!("{}.json", identity.as_str())
}

/// Temporary sibling used for atomic writes. Dot-prefixed so loads skip it.
pub(super) fn temp_filename(identity: &Identity) -> String {
    format!(".{}.json.tmp", identity.as_str())
}
