//! Watch-directory monitoring.
//!
//! Turns raw filesystem activity into a stream of stable
//! [`ExportCandidate`](intake_core::ExportCandidate)s:
//! - `EventSource` capability with native (`NotifySource`) and polling
//!   (`PollSource`) implementations
//! - `StabilityTracker` deciding when a file has stopped changing
//! - `DirectoryWatcher` driving both and feeding the pipeline queue

pub mod error;
pub mod source;
pub mod stability;
pub mod watcher;

pub use error::WatchError;
pub use source::{source_for, ChangeEvent, ChangeKind, EventSource, NotifySource, PollSource};
pub use stability::{FileState, StabilityTracker};
pub use watcher::DirectoryWatcher;
