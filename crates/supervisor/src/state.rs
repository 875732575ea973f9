//! Worker lifecycle states and the shared handle that publishes them.

use std::fmt;

use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle of a supervised worker.
///
/// ```text
/// Starting ──▶ Watching ──▶ Draining ──▶ Stopped
///    │            │            │
///    └──────┬─────┘            │
///           ▼                  │
///        Crashed ──▶ Starting  │
///           │                  │
///           └────▶ Failed ◀────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Starting,
    Watching,
    Draining,
    Stopped,
    Crashed,
    Failed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Watching => "watching",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Watching | Draining | Stopped | Crashed | Failed)
                | (Watching, Draining | Stopped | Crashed | Failed)
                | (Draining, Stopped | Failed)
                | (Crashed, Starting | Stopped | Failed)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes [`WorkerState`] changes; shared by the supervisor and the worker.
#[derive(Debug)]
pub struct StateHandle {
    name: String,
    tx: watch::Sender<WorkerState>,
}

impl StateHandle {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(WorkerState::Starting);
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn current(&self) -> WorkerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition is allowed. Returns whether it moved.
    pub fn transition(&self, next: WorkerState) -> bool {
        let mut from = next;
        let moved = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(worker = %self.name, from = from.as_str(), state = next.as_str(), "worker state changed");
        } else if from != next {
            warn!(worker = %self.name, from = from.as_str(), to = next.as_str(), "ignored invalid state transition");
        }
        moved
    }
}
