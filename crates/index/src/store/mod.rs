mod error;

pub use error::IndexError;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use intake_core::{ExportCandidate, Identity, IngestionRecord, RecordStatus};

use error::{record_filename, temp_filename};

/// Filesystem-backed identity index.
///
/// One JSON document per identity, written atomically:
/// ```text
/// .intake-index/
///   records/
///     3f2a…c1.json          <- IngestionRecord for that content hash
///     .3f2a…c1.json.tmp     <- in-progress write (ignored on load)
///   corrupt/
///     9b0e…77.json          <- unparseable records moved aside on open
/// ```
///
/// All records are held in memory behind a mutex; every mutation is
/// written through to disk before the lock is released, so the on-disk
/// state is never behind what callers have observed.
pub struct IngestionIndex {
    base_dir: PathBuf,
    state: Mutex<IndexState>,
    released: Notify,
}

#[derive(Default)]
struct IndexState {
    records: HashMap<Identity, IngestionRecord>,
    in_flight: HashSet<Identity>,
}

/// Result of [`IngestionIndex::claim`].
pub enum Claim {
    /// The caller now exclusively owns the identity until `guard` drops.
    Acquired {
        record: IngestionRecord,
        guard: ClaimGuard,
        /// `true` when an unfinished record from an earlier attempt was found.
        resumed: bool,
    },
    /// Content already stored and acknowledged; nothing to do.
    AlreadyAcknowledged(IngestionRecord),
    /// Content previously gave up; not retried until reset.
    PermanentlyFailed(IngestionRecord),
    /// Another worker is ingesting the same content right now.
    InFlight,
}

/// Releases an identity claim on drop.
pub struct ClaimGuard {
    index: Arc<IngestionIndex>,
    identity: Identity,
}

impl ClaimGuard {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.index.lock().in_flight.remove(&self.identity);
        self.index.released.notify_waiters();
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total: usize,
    pub pending: usize,
    pub stored: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub in_flight: usize,
}

impl IngestionIndex {
    /// Open (or create) the index at `base_dir`, loading every record.
    ///
    /// Leftover temp files from an interrupted write are removed; records
    /// that fail to parse are moved to `corrupt/` and skipped.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join("records");
        fs::create_dir_all(&records_dir)?;

        let mut records = HashMap::new();
        for entry in fs::read_dir(&records_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') {
                if name.ends_with(".tmp") {
                    debug!(path = %path.display(), "removing interrupted index write");
                    let _ = fs::remove_file(&path);
                }
                continue;
            }
            if !name.ends_with(".json") {
                continue;
            }

            match load_record(&path) {
                Ok(record) => {
                    records.insert(record.candidate_id.clone(), record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable index record, moving aside");
                    quarantine(&base_dir, &path, &name);
                }
            }
        }

        info!(path = %base_dir.display(), records = records.len(), "identity index opened");

        Ok(Self {
            base_dir,
            state: Mutex::new(IndexState {
                records,
                in_flight: HashSet::new(),
            }),
            released: Notify::new(),
        })
    }

    /// Base path for this index.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn records_dir(&self) -> PathBuf {
        self.base_dir.join("records")
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, identity: &Identity) -> Option<IngestionRecord> {
        self.lock().records.get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes once any claim is released after this call.
    ///
    /// Create it before retrying a [`Claim::InFlight`] so a release in
    /// between is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Claim an identity for ingestion.
    ///
    /// Creates and persists a fresh record the first time an identity is
    /// seen. An unfinished record (pending or stored) is resumed with its
    /// attempt count intact.
    pub fn claim(
        self: &Arc<Self>,
        identity: &Identity,
        candidate: &ExportCandidate,
        size: u64,
    ) -> Result<Claim, IndexError> {
        let mut state = self.lock();

        if state.in_flight.contains(identity) {
            return Ok(Claim::InFlight);
        }

        let (record, resumed) = match state.records.get(identity) {
            Some(existing) if existing.remote_ack => {
                return Ok(Claim::AlreadyAcknowledged(existing.clone()));
            }
            Some(existing) if existing.status == RecordStatus::Failed => {
                return Ok(Claim::PermanentlyFailed(existing.clone()));
            }
            Some(existing) => {
                let mut record = existing.clone();
                record.observe_source(candidate);
                (record, true)
            }
            None => (IngestionRecord::new(identity.clone(), candidate, size), false),
        };

        self.write_record(&record)?;
        state.records.insert(identity.clone(), record.clone());
        state.in_flight.insert(identity.clone());

        Ok(Claim::Acquired {
            record,
            guard: ClaimGuard {
                index: Arc::clone(self),
                identity: identity.clone(),
            },
            resumed,
        })
    }

    /// Persist a new version of a record.
    pub fn update(&self, record: &IngestionRecord) -> Result<(), IndexError> {
        let mut state = self.lock();
        self.write_record(record)?;
        state
            .records
            .insert(record.candidate_id.clone(), record.clone());
        Ok(())
    }

    /// Make a permanently failed record eligible again. Attempts restart at zero.
    pub fn reset(&self, identity: &Identity) -> Result<IngestionRecord, IndexError> {
        let mut state = self.lock();
        let mut record = state
            .records
            .get(identity)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(identity.clone()))?;
        record.status = if record.stored_path.is_some() {
            RecordStatus::Stored
        } else {
            RecordStatus::Pending
        };
        record.attempts = 0;
        record.last_error = None;
        record.last_error_message = None;
        self.write_record(&record)?;
        state.records.insert(identity.clone(), record.clone());
        info!(identity = %identity.short(), "index record reset");
        Ok(record)
    }

    /// Reset every failed record; returns how many were reset.
    pub fn reset_failed(&self) -> Result<usize, IndexError> {
        let failed: Vec<Identity> = self
            .lock()
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Failed)
            .map(|r| r.candidate_id.clone())
            .collect();
        for identity in &failed {
            self.reset(identity)?;
        }
        Ok(failed.len())
    }

    /// Records that are neither acknowledged nor failed (interrupted work).
    pub fn unfinished(&self) -> Vec<IngestionRecord> {
        let mut out: Vec<IngestionRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.lock();
        let mut stats = IndexStats {
            total: state.records.len(),
            in_flight: state.in_flight.len(),
            ..Default::default()
        };
        for record in state.records.values() {
            match record.status {
                RecordStatus::Pending => stats.pending += 1,
                RecordStatus::Stored => stats.stored += 1,
                RecordStatus::Acknowledged => stats.acknowledged += 1,
                RecordStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Atomically write a record: temp file, fsync, rename.
    fn write_record(&self, record: &IngestionRecord) -> Result<(), IndexError> {
        let dir = self.records_dir();
        let final_path = dir.join(record_filename(&record.candidate_id));
        let tmp_path = dir.join(temp_filename(&record.candidate_id));

        let json = serde_json::to_vec_pretty(record)?;
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        debug!(
            identity = %record.candidate_id.short(),
            status = record.status.as_str(),
            attempts = record.attempts,
            "index record written"
        );
        Ok(())
    }
}

fn load_record(path: &Path) -> Result<IngestionRecord, IndexError> {
    let json = fs::read(path)?;
    Ok(serde_json::from_slice(&json)?)
}

fn quarantine(base_dir: &Path, path: &Path, name: &str) {
    let corrupt_dir = base_dir.join("corrupt");
    if let Err(e) = fs::create_dir_all(&corrupt_dir)
        .and_then(|_| fs::rename(path, corrupt_dir.join(name)))
    {
        warn!(path = %path.display(), error = %e, "failed to move corrupt record aside");
    }
}
