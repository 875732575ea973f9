use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ChangeEvent, ChangeKind, EventSource, EVENT_BUFFER};
use crate::error::WatchError;

/// `(size, mtime)` per top-level entry.
type Snapshot = HashMap<PathBuf, (u64, Option<SystemTime>)>;

/// Periodic directory snapshots, diffed into change events.
///
/// For network shares and other mounts where native events are missing
/// or unreliable.
pub struct PollSource {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl PollSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }
}

impl Drop for PollSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl EventSource for PollSource {
    async fn watch(&mut self, dir: &Path) -> Result<mpsc::Receiver<ChangeEvent>, WatchError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let baseline = snapshot(dir).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let dir = dir.to_path_buf();
        let interval = self.interval;

        info!(path = %dir.display(), interval_ms = interval.as_millis() as u64, "watching export directory (polling)");

        self.task = Some(tokio::spawn(async move {
            let mut previous = baseline;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let current = match snapshot(&dir).await {
                    Ok(current) => current,
                    Err(e) => {
                        // Accessibility is judged by the watcher loop.
                        debug!(path = %dir.display(), error = %e, "poll snapshot failed");
                        continue;
                    }
                };

                for change in diff(&previous, &current) {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }
        }));

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

async fn snapshot(dir: &Path) -> std::io::Result<Snapshot> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut out = Snapshot::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        out.insert(entry.path(), (meta.len(), meta.modified().ok()));
    }
    Ok(out)
}

fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    for (path, state) in current {
        match previous.get(path) {
            None => changes.push(ChangeEvent::new(ChangeKind::Created, path.clone())),
            Some(old) if old != state => {
                changes.push(ChangeEvent::new(ChangeKind::Modified, path.clone()))
            }
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.push(ChangeEvent::new(ChangeKind::Removed, path.clone()));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_created_modified_removed() {
        let t = SystemTime::UNIX_EPOCH;
        let previous: Snapshot = [
            (PathBuf::from("/x/kept.csv"), (1, Some(t))),
            (PathBuf::from("/x/grown.csv"), (1, Some(t))),
            (PathBuf::from("/x/gone.csv"), (1, Some(t))),
        ]
        .into_iter()
        .collect();
        let current: Snapshot = [
            (PathBuf::from("/x/kept.csv"), (1, Some(t))),
            (PathBuf::from("/x/grown.csv"), (9, Some(t))),
            (PathBuf::from("/x/new.csv"), (3, Some(t))),
        ]
        .into_iter()
        .collect();

        let mut changes = diff(&previous, &current);
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            changes,
            vec![
                ChangeEvent::new(ChangeKind::Removed, "/x/gone.csv"),
                ChangeEvent::new(ChangeKind::Modified, "/x/grown.csv"),
                ChangeEvent::new(ChangeKind::Created, "/x/new.csv"),
            ]
        );
    }

    #[tokio::test]
    async fn poll_source_reports_new_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut source = PollSource::new(Duration::from_millis(20));
        let mut rx = source.watch(tmp.path()).await.unwrap();

        std::fs::write(tmp.path().join("claim.csv"), b"a,b\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("source alive");
        assert_eq!(event.kind, ChangeKind::Created);
        assert!(event.path.ends_with("claim.csv"));
    }
}
