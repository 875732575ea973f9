use intake_api::DeliveryError;
use intake_core::ErrorKind;
use intake_index::IndexError;

/// Failures that stop the pipeline for one candidate and must reach the worker.
///
/// Everything recoverable per file (unreadable source, store exhaustion,
/// rejected or exhausted delivery) is recorded on the index record and
/// reported as an [`Outcome`](crate::Outcome) instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("identity index: {0}")]
    Index(#[from] IndexError),

    #[error("delivery of {identity} failed: {source}")]
    Fatal {
        identity: String,
        #[source]
        source: DeliveryError,
    },

    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Index(e) => match e.kind() {
                ErrorKind::TransientIo => ErrorKind::SupervisorCrash,
                other => other,
            },
            Self::Fatal { source, .. } => source.kind(),
            Self::Task(_) => ErrorKind::SupervisorCrash,
        }
    }
}
