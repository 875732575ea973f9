//! Decides when a file in the watch directory has finished being written.
//!
//! A file is stable once its size and mtime are unchanged across two
//! observations at least `quiescence` apart. Each `(path, mtime, size)`
//! is emitted at most once; a replaced file has a new key and is emitted
//! again.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use intake_core::config::WatchSettings;
use intake_core::{CandidateKey, ExportCandidate};

/// The observable parts of a file used for stability decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub size: u64,
    pub modified: SystemTime,
}

impl FileState {
    /// `None` for anything that is not a regular file.
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        if !meta.is_file() {
            return None;
        }
        Some(Self {
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

#[derive(Debug)]
struct Observation {
    state: FileState,
    /// When `state` was first seen unchanged.
    since: Instant,
    first_seen: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StabilityTracker {
    quiescence: Duration,
    ignore_suffixes: Vec<String>,
    pending: HashMap<PathBuf, Observation>,
    emitted: HashMap<PathBuf, CandidateKey>,
}

impl StabilityTracker {
    pub fn new(quiescence: Duration, ignore_suffixes: Vec<String>) -> Self {
        Self {
            quiescence,
            ignore_suffixes: ignore_suffixes
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            pending: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &WatchSettings) -> Self {
        Self::new(settings.quiescence, settings.ignore_suffixes.clone())
    }

    /// Dotfiles and partial-download suffixes are never candidates.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_ascii_lowercase()) else {
            return true;
        };
        name.starts_with('.') || self.ignore_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }

    /// Record an observation; returns a candidate when the file just became stable.
    pub fn observe(&mut self, path: &Path, state: FileState, now: Instant) -> Option<ExportCandidate> {
        if self.is_ignored(path) {
            return None;
        }

        let modified_at: DateTime<Utc> = state.modified.into();
        let key = CandidateKey {
            path: path.to_path_buf(),
            modified_at,
            size: state.size,
        };
        if self.emitted.get(path) == Some(&key) {
            self.pending.remove(path);
            return None;
        }

        match self.pending.get_mut(path) {
            Some(obs) if obs.state == state => {
                // Zero-byte files stay pending until they grow.
                if state.size == 0 || now.duration_since(obs.since) < self.quiescence {
                    return None;
                }
                let obs = self.pending.remove(path)?;
                let mut candidate = ExportCandidate::new(path.to_path_buf(), state.size, modified_at);
                candidate.detected_at = obs.first_seen;
                candidate.stability_confirmed = true;
                self.emitted.insert(path.to_path_buf(), key);
                Some(candidate)
            }
            Some(obs) => {
                obs.state = state;
                obs.since = now;
                None
            }
            None => {
                self.pending.insert(
                    path.to_path_buf(),
                    Observation {
                        state,
                        since: now,
                        first_seen: Utc::now(),
                    },
                );
                None
            }
        }
    }

    /// Drop all knowledge of a path (it was removed or moved away).
    pub fn forget(&mut self, path: &Path) {
        self.pending.remove(path);
        self.emitted.remove(path);
    }

    /// Paths still waiting to settle.
    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.pending.keys().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
