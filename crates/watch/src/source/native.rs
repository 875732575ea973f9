use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

use super::{ChangeEvent, ChangeKind, EventSource, EVENT_BUFFER};
use crate::error::WatchError;

/// Native filesystem notifications (inotify, FSEvents, ReadDirectoryChangesW).
///
/// The notify callback runs on the backend's own thread and never blocks:
/// when the buffer is full the event is dropped and a `Rescan` is queued
/// ahead of the next one.
#[derive(Default)]
pub struct NotifySource {
    watcher: Option<RecommendedWatcher>,
}

impl NotifySource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventSource for NotifySource {
    async fn watch(&mut self, dir: &Path) -> Result<mpsc::Receiver<ChangeEvent>, WatchError> {
        // Release the previous backend before subscribing again.
        self.watcher = None;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let overflowed = Arc::new(AtomicBool::new(false));
        let watched = dir.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let mut changes = translate(res, &watched);
            if overflowed.swap(false, Ordering::Relaxed) {
                changes.insert(0, ChangeEvent::new(ChangeKind::Rescan, watched.clone()));
            }
            for change in changes {
                match tx.try_send(change) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflowed.store(true, Ordering::Relaxed);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        info!(path = %dir.display(), "watching export directory (native events)");
        self.watcher = Some(watcher);
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "notify"
    }
}

fn translate(res: notify::Result<Event>, watched: &Path) -> Vec<ChangeEvent> {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "filesystem watcher error, scheduling rescan");
            return vec![ChangeEvent::new(ChangeKind::Rescan, watched)];
        }
    };

    if event.need_rescan() {
        return vec![ChangeEvent::new(ChangeKind::Rescan, watched)];
    }

    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Access(_) => return Vec::new(),
        EventKind::Any | EventKind::Other => {
            return vec![ChangeEvent::new(ChangeKind::Rescan, watched)];
        }
    };

    event
        .paths
        .into_iter()
        .map(|path| ChangeEvent::new(kind, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use notify::event::{CreateKind, ModifyKind, RenameMode};

    use super::*;

    fn dir() -> PathBuf {
        PathBuf::from("/exports")
    }

    #[test]
    fn create_and_rename_map_to_changes() {
        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/exports/a.csv"));
        assert_eq!(
            translate(Ok(created), &dir()),
            vec![ChangeEvent::new(ChangeKind::Created, "/exports/a.csv")]
        );

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/exports/a.csv.part"))
            .add_path(PathBuf::from("/exports/a.csv"));
        let changes = translate(Ok(renamed), &dir());
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Modified));
    }

    #[test]
    fn errors_and_unknown_events_request_rescan() {
        let err = translate(Err(notify::Error::generic("queue overflow")), &dir());
        assert_eq!(err, vec![ChangeEvent::new(ChangeKind::Rescan, "/exports")]);

        let other = translate(Ok(Event::new(EventKind::Other)), &dir());
        assert_eq!(other[0].kind, ChangeKind::Rescan);
    }

    #[tokio::test]
    async fn native_source_reports_new_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut source = NotifySource::new();
        let mut rx = source.watch(tmp.path()).await.unwrap();

        std::fs::write(tmp.path().join("claim.csv"), b"a,b\n").unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("source alive");
        assert!(event.path.ends_with("claim.csv") || event.kind == ChangeKind::Rescan);
    }
}
