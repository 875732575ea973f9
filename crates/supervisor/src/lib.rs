//! Worker lifecycle supervision.
//!
//! Provides the [`Worker`] trait for the long-running intake process,
//! [`SupervisorBuilder`] for fluent configuration, and [`Supervisor`] for
//! running it with heartbeats, signal-driven draining, and bounded restarts.

pub mod error;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use error::{SupervisorError, WorkerError};
pub use state::{StateHandle, WorkerState};
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use worker::{RunContext, Worker, WorkerHealth};
