//! Sources of raw change events for the watch directory.

mod native;
mod poll;

pub use native::NotifySource;
pub use poll::PollSource;

use std::path::{Path, PathBuf};

use intake_core::config::WatchSettings;
use intake_core::WatchMode;
use tokio::sync::mpsc;

use crate::error::WatchError;

/// Buffer between an event source and the watcher loop.
pub(crate) const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// Events may have been lost; the whole directory must be re-listed.
    Rescan,
}

/// A change to one path in the watch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// The changed file, or the watched directory itself for `Rescan`.
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Something that reports changes in a single (non-recursive) directory.
///
/// Calling `watch` again replaces any earlier subscription; the receiver
/// returned by the previous call stops yielding events.
#[async_trait::async_trait]
pub trait EventSource: Send {
    async fn watch(&mut self, dir: &Path) -> Result<mpsc::Receiver<ChangeEvent>, WatchError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Pick the event source for the configured watch mode.
pub fn source_for(settings: &WatchSettings) -> Box<dyn EventSource> {
    match settings.mode {
        WatchMode::Notify => Box::new(NotifySource::new()),
        WatchMode::Poll => Box::new(PollSource::new(settings.poll_interval)),
    }
}
