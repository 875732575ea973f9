use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use intake_core::config::WatchSettings;
use intake_core::{ExportCandidate, Settings};

use crate::error::WatchError;
use crate::source::{source_for, ChangeEvent, ChangeKind, EventSource};
use crate::stability::{FileState, StabilityTracker};

/// Watches one directory and emits stable [`ExportCandidate`]s.
///
/// Change events only mark paths as dirty; every `poll_interval` the dirty
/// and still-pending paths are stat'ed and fed to the [`StabilityTracker`].
/// Existing files are enumerated once at startup, and again whenever the
/// event source asks for a rescan.
pub struct DirectoryWatcher {
    dir: PathBuf,
    settings: WatchSettings,
    source: Box<dyn EventSource>,
    tracker: StabilityTracker,
    dirty: HashSet<PathBuf>,
    rescan: bool,
}

impl DirectoryWatcher {
    pub fn new(dir: impl Into<PathBuf>, settings: WatchSettings, source: Box<dyn EventSource>) -> Self {
        let tracker = StabilityTracker::from_settings(&settings);
        Self {
            dir: dir.into(),
            settings,
            source,
            tracker,
            dirty: HashSet::new(),
            rescan: true,
        }
    }

    /// Watcher over `CCC_EXPORT_WATCH` using the configured watch mode.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.watch_dir(),
            settings.watch().clone(),
            source_for(settings.watch()),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run until `shutdown` fires or the candidate queue closes.
    ///
    /// Returns an error when the event source dies or the directory stays
    /// inaccessible for `unavailable_threshold` consecutive checks.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<ExportCandidate>,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        let mut events = self.source.watch(&self.dir).await?;
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        info!(
            path = %self.dir.display(),
            source = self.source.name(),
            quiescence_ms = self.settings.quiescence.as_millis() as u64,
            "directory watcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(path = %self.dir.display(), "directory watcher stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_directory() {
                        failures += 1;
                        warn!(
                            path = %self.dir.display(),
                            error = %e,
                            failures,
                            threshold = self.settings.unavailable_threshold,
                            "watch directory inaccessible"
                        );
                        if failures >= self.settings.unavailable_threshold {
                            error!(path = %self.dir.display(), "watch directory unavailable, giving up");
                            return Err(WatchError::DirectoryUnavailable {
                                path: self.dir.clone(),
                                attempts: failures,
                                source: e,
                            });
                        }
                        continue;
                    }
                    if failures > 0 {
                        info!(path = %self.dir.display(), "watch directory accessible again");
                        failures = 0;
                        events = self.source.watch(&self.dir).await?;
                        self.rescan = true;
                    }

                    for candidate in self.poll(Instant::now()) {
                        debug!(path = %candidate.source_path.display(), size = candidate.size, "candidate stable");
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            sent = tx.send(candidate) => {
                                if sent.is_err() {
                                    info!("candidate queue closed, directory watcher stopping");
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                change = events.recv() => match change {
                    Some(change) => self.handle_change(change),
                    None => return Err(WatchError::SourceClosed(self.source.name())),
                },
            }
        }
    }

    /// Single pass: enumerate, wait one quiescence window, return what settled.
    pub async fn collect_stable(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExportCandidate>, WatchError> {
        self.check_directory()?;
        self.rescan = true;
        let mut ready = self.poll(Instant::now());

        if self.tracker.pending_len() > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(ready),
                _ = tokio::time::sleep(self.settings.quiescence) => {}
            }
            ready.extend(self.poll(Instant::now()));
        }

        let unsettled = self.tracker.pending_len();
        if unsettled > 0 {
            info!(unsettled, "files still changing, left for the next pass");
        }
        Ok(ready)
    }

    fn handle_change(&mut self, change: ChangeEvent) {
        match change.kind {
            ChangeKind::Rescan => self.rescan = true,
            ChangeKind::Removed => {
                self.dirty.remove(&change.path);
                self.tracker.forget(&change.path);
            }
            ChangeKind::Created | ChangeKind::Modified => {
                if self.is_direct_child(&change.path) && !self.tracker.is_ignored(&change.path) {
                    self.dirty.insert(change.path);
                }
            }
        }
    }

    fn is_direct_child(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
    }

    fn check_directory(&self) -> io::Result<()> {
        let meta = fs::metadata(&self.dir)?;
        if !meta.is_dir() {
            return Err(io::Error::other(format!("{} is not a directory", self.dir.display())));
        }
        fs::read_dir(&self.dir).map(|_| ())
    }

    /// List every top-level entry into the dirty set.
    fn list_directory(&mut self) -> io::Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !self.tracker.is_ignored(&path) {
                self.dirty.insert(path);
            }
        }
        Ok(())
    }

    /// Stat dirty and pending paths; return the ones that just became stable.
    fn poll(&mut self, now: Instant) -> Vec<ExportCandidate> {
        if self.rescan {
            match self.list_directory() {
                Ok(()) => self.rescan = false,
                Err(e) => warn!(path = %self.dir.display(), error = %e, "directory listing failed"),
            }
        }

        let mut paths: Vec<PathBuf> = self.dirty.drain().collect();
        paths.extend(self.tracker.pending_paths());
        paths.sort();
        paths.dedup();

        let mut ready = Vec::new();
        for path in paths {
            match fs::metadata(&path) {
                Ok(meta) => {
                    if let Some(state) = FileState::from_metadata(&meta) {
                        ready.extend(self.tracker.observe(&path, state, now));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => self.tracker.forget(&path),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stat failed, will retry");
                    self.dirty.insert(path);
                }
            }
        }
        ready
    }
}
