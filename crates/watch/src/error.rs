use std::io;
use std::path::PathBuf;

use intake_core::ErrorKind;

/// Errors raised while watching the export directory.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch directory {path} unavailable after {attempts} checks: {source}")]
    DirectoryUnavailable {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("filesystem notification error: {0}")]
    Notify(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event source {0} stopped unexpectedly")]
    SourceClosed(&'static str),
}

impl WatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::TransientIo,
            Self::DirectoryUnavailable { .. } | Self::Notify(_) | Self::SourceClosed(_) => {
                ErrorKind::SupervisorCrash
            }
        }
    }
}
