//! The supervised worker seam.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::state::{StateHandle, WorkerState};

/// Handed to [`Worker::run`] for one run.
#[derive(Clone)]
pub struct RunContext {
    /// Stop accepting new work and finish what is in flight.
    pub shutdown: CancellationToken,
    /// Grace deadline passed: abandon in-flight work.
    pub abort: CancellationToken,
    state: Arc<StateHandle>,
}

impl RunContext {
    pub fn new(shutdown: CancellationToken, abort: CancellationToken, state: Arc<StateHandle>) -> Self {
        Self {
            shutdown,
            abort,
            state,
        }
    }

    /// Report that startup finished and the worker is watching.
    pub fn mark_watching(&self) {
        self.state.transition(WorkerState::Watching);
    }

    pub fn state(&self) -> WorkerState {
        self.state.current()
    }
}

/// Point-in-time counters logged with every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerHealth {
    pub queued: usize,
    pub in_flight: usize,
    pub acknowledged: u64,
    pub duplicates: u64,
    pub failed: u64,
}

/// A long-running process run by the [`Supervisor`](crate::Supervisor).
///
/// `run` returns `Ok(())` after a clean stop (shutdown requested or a
/// single pass completed) and an error when a component died.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<(), WorkerError>;

    /// Human-readable name for this worker (used in logging).
    fn name(&self) -> &str;

    fn health(&self) -> WorkerHealth {
        WorkerHealth::default()
    }
}
