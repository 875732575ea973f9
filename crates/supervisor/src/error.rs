use intake_core::ErrorKind;

/// How a worker run ended, when it did not end cleanly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Needs an operator (bad credential, bad configuration). Never restarted.
    #[error("{kind}: {message}")]
    Fatal { kind: ErrorKind, message: String },

    /// A component died; the supervisor may restart the worker.
    #[error("crashed: {message}")]
    Crashed { message: String },
}

impl WorkerError {
    /// Classify a component failure by its error class.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_fatal() {
            Self::Fatal { kind, message }
        } else {
            Self::Crashed { message }
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::Crashed {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal { kind, .. } => *kind,
            Self::Crashed { .. } => ErrorKind::SupervisorCrash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker {worker} failed fatally: {source}")]
    Fatal {
        worker: String,
        #[source]
        source: WorkerError,
    },

    #[error("worker {worker} crashed {crashes} times in a row, giving up: {last}")]
    RestartsExhausted {
        worker: String,
        crashes: u32,
        last: WorkerError,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal { source, .. } => source.kind(),
            Self::RestartsExhausted { .. } => ErrorKind::SupervisorCrash,
        }
    }
}
