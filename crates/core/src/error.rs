use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classes shared by every component.
///
/// Component errors map onto one of these through their `kind()` method;
/// the class decides whether a failure is retried, recorded, or fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad configuration, fatal at startup.
    Config,
    /// Filesystem hiccup, retried with backoff.
    TransientIo,
    /// Network failure, 429 or 5xx, retried with backoff.
    TransientNetwork,
    /// Unreadable file or permanent remote rejection; recorded, not retried.
    PermanentValidation,
    /// Credential rejected by the remote API; needs an operator.
    Auth,
    /// A component failed in a way that needs a restart.
    SupervisorCrash,
}

impl ErrorKind {
    /// Fatal classes terminate the process.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Config | Self::Auth)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientIo | Self::TransientNetwork)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::TransientIo => "transient_io",
            Self::TransientNetwork => "transient_network",
            Self::PermanentValidation => "permanent_validation",
            Self::Auth => "auth",
            Self::SupervisorCrash => "supervisor_crash",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must not be empty")]
    Empty { key: &'static str },

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("API_BASE is not a valid http(s) URL: {0}")]
    InvalidUrl(String),

    #[error("watch directory {} is not accessible: {reason}", path.display())]
    WatchDir { path: PathBuf, reason: String },

    #[error("storage root {} is not usable: {reason}", path.display())]
    StorageRoot { path: PathBuf, reason: String },

    #[error("watch directory and storage root resolve to the same path: {}", .0.display())]
    SamePath(PathBuf),

    #[error("failed to load env file {}: {reason}", path.display())]
    EnvFile { path: PathBuf, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}
