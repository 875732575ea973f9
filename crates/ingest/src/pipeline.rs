//! Per-candidate ingestion: hash, claim, store, notify, dispose.
//!
//! Every step leaves the identity index consistent, so a crash between
//! two steps is resumed from the record on the next sighting. The abort
//! token is checked between steps and during backoff sleeps; blocking
//! writes are never interrupted.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use intake_api::{
    AttemptEvent, Deliverer, DeliveryError, EventReporter, EventStage, IngestApi, IngestionNotice,
    NoticeMetadata, RetryPolicy,
};
use intake_core::{
    ErrorKind, ExportCandidate, Identity, IngestionRecord, RecordStatus, Settings,
};
use intake_index::{Claim, ClaimGuard, IndexError, IngestionIndex};

use crate::disposition::{Disposed, Disposer};
use crate::error::PipelineError;
use crate::mime::mime_for;
use crate::storage::{ContentStore, StoreError, Stored};

/// How one candidate ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stored and acknowledged in this run.
    Acknowledged {
        identity: Identity,
        stored_path: PathBuf,
        attempts: u32,
    },
    /// Content was acknowledged before; nothing written or sent.
    Duplicate { identity: Identity },
    /// Another task holds the identity and will finish it.
    InFlight { identity: Identity },
    /// Content gave up earlier and has not been reset.
    PreviouslyFailed { identity: Identity },
    /// Not ingested this time; the file may show up again.
    Skipped { path: PathBuf, reason: &'static str },
    /// The source could not be read, so it has no identity to record
    /// against. Reported and counted as failed; the watcher offers the
    /// same `(path, mtime, size)` only once.
    Unreadable { path: PathBuf, message: String },
    /// Gave up and marked the record failed.
    Failed {
        identity: Identity,
        kind: ErrorKind,
        message: String,
    },
    /// Abort requested between steps.
    Cancelled,
}

/// Running totals reported in worker heartbeats.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    acknowledged: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl PipelineCounters {
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Backoff for filesystem retries while storing.
#[derive(Debug, Clone, Copy)]
pub struct IoRetry {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for IoRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

pub struct IngestPipeline {
    index: Arc<IngestionIndex>,
    store: ContentStore,
    deliverer: Deliverer,
    events: EventReporter,
    disposer: Disposer,
    io_retry: IoRetry,
    counters: PipelineCounters,
}

impl IngestPipeline {
    pub fn new(
        index: Arc<IngestionIndex>,
        store: ContentStore,
        deliverer: Deliverer,
        events: EventReporter,
        disposer: Disposer,
    ) -> Self {
        Self {
            index,
            store,
            deliverer,
            events,
            disposer,
            io_retry: IoRetry::default(),
            counters: PipelineCounters::default(),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        index: Arc<IngestionIndex>,
        api: Arc<dyn IngestApi>,
    ) -> Self {
        let deliverer = Deliverer::new(Arc::clone(&api), RetryPolicy::from_settings(settings.retry()));
        let events = EventReporter::new(api, settings.pipeline().report_events);
        Self::new(
            index,
            ContentStore::new(settings.storage_root()),
            deliverer,
            events,
            Disposer::from_settings(settings),
        )
    }

    pub fn with_io_retry(mut self, io_retry: IoRetry) -> Self {
        self.io_retry = io_retry;
        self
    }

    pub fn index(&self) -> &Arc<IngestionIndex> {
        &self.index
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    /// Ingest one stable candidate.
    ///
    /// Per-file problems come back as an [`Outcome`]; an `Err` means the
    /// worker itself cannot go on (fatal credential, index unwritable).
    pub async fn process(
        &self,
        candidate: ExportCandidate,
        abort: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        if abort.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let source = candidate.source_path.clone();
        self.events
            .emit(
                None,
                EventStage::Received,
                "export detected",
                json!({ "path": source, "size": candidate.size }),
            )
            .await;

        let (identity, size) = match hash_file(&source).await? {
            Ok(hashed) => hashed,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(self.skip(source, "source vanished"));
            }
            Err(e) => {
                PipelineCounters::bump(&self.counters.failed);
                let message = e.to_string();
                self.events
                    .emit(
                        None,
                        EventStage::Error,
                        format!("unreadable export: {message}"),
                        json!({ "path": source, "kind": ErrorKind::PermanentValidation }),
                    )
                    .await;
                return Ok(Outcome::Unreadable { path: source, message });
            }
        };
        if size == 0 {
            return Ok(self.skip(source, "empty file"));
        }
        if size != candidate.size || changed_since(&source, candidate.modified_at).await {
            return Ok(self.skip(source, "changed since it settled"));
        }

        if abort.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let Some(claim) = self.claim_when_free(&identity, &candidate, size, abort).await? else {
            return Ok(Outcome::Cancelled);
        };
        let (record, guard, resumed) = match claim {
            Claim::Acquired {
                record,
                guard,
                resumed,
            } => (record, guard, resumed),
            Claim::AlreadyAcknowledged(record) => {
                PipelineCounters::bump(&self.counters.duplicates);
                self.events
                    .emit(
                        Some(&identity),
                        EventStage::Duplicate,
                        "content already ingested",
                        json!({ "path": source, "stored_path": record.stored_path }),
                    )
                    .await;
                self.dispose(&source, &identity, true).await;
                return Ok(Outcome::Duplicate { identity });
            }
            Claim::PermanentlyFailed(record) => {
                info!(
                    identity = %identity.short(),
                    path = %source.display(),
                    attempts = record.attempts,
                    "content failed earlier, skipping until reset"
                );
                self.dispose(&source, &identity, false).await;
                return Ok(Outcome::PreviouslyFailed { identity });
            }
            Claim::InFlight => return Ok(Outcome::InFlight { identity }),
        };
        if resumed {
            info!(
                identity = %identity.short(),
                status = record.status.as_str(),
                attempts = record.attempts,
                "resuming unfinished ingestion"
            );
        }

        let stored = match self.store_with_retry(&record, abort).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(Outcome::Cancelled),
            Err(StoreError::SourceGone { .. }) => return Ok(self.skip(source, "source vanished")),
            Err(StoreError::Mismatch { .. }) => {
                return Ok(self.skip(source, "changed while copying"));
            }
            Err(e) => {
                return self
                    .give_up(record, guard, ErrorKind::TransientIo, e.to_string())
                    .await;
            }
        };

        self.deliver(record, guard, &candidate, stored, abort).await
    }

    /// Stored records whose source file is gone.
    ///
    /// The watcher rediscovers interrupted work while the source is still
    /// present; these are the ones only the index remembers.
    pub fn stranded(&self) -> Vec<IngestionRecord> {
        self.index
            .unfinished()
            .into_iter()
            .filter(|r| r.status == RecordStatus::Stored && r.stored_path.is_some())
            .filter(|r| !r.source_path.exists())
            .collect()
    }

    /// Finish a stored record from its stored copy alone.
    pub async fn resume(
        &self,
        record: IngestionRecord,
        abort: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let Some(stored_path) = record.stored_path.clone() else {
            return Ok(self.skip(record.source_path, "nothing stored"));
        };
        if abort.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let mut candidate = ExportCandidate::new(record.source_path.clone(), record.size, record.created_at);
        candidate.detected_at = record.created_at;
        candidate.stability_confirmed = true;

        let (record, guard) = match self.index.claim(&record.candidate_id, &candidate, record.size)? {
            Claim::Acquired { record, guard, .. } => (record, guard),
            Claim::AlreadyAcknowledged(record) => {
                return Ok(Outcome::Duplicate {
                    identity: record.candidate_id,
                })
            }
            Claim::PermanentlyFailed(record) => {
                return Ok(Outcome::PreviouslyFailed {
                    identity: record.candidate_id,
                })
            }
            Claim::InFlight => {
                return Ok(Outcome::InFlight {
                    identity: record.candidate_id,
                })
            }
        };

        let intact = match self.store.verify(&stored_path, &record.candidate_id, record.size).await {
            Ok(intact) => intact,
            Err(e) => {
                warn!(path = %stored_path.display(), error = %e, "could not verify stored copy");
                return Ok(self.skip(stored_path, "stored copy unreadable"));
            }
        };
        if !intact {
            return self
                .give_up(
                    record,
                    guard,
                    ErrorKind::PermanentValidation,
                    "stored copy no longer matches and the source is gone".to_string(),
                )
                .await;
        }

        info!(
            identity = %record.candidate_id.short(),
            attempts = record.attempts,
            "resuming delivery of stored artifact"
        );
        let stored = Stored {
            path: stored_path,
            reused: true,
        };
        self.deliver(record, guard, &candidate, stored, abort).await
    }

    /// Claim `identity`, waiting while another task holds it.
    ///
    /// Same content under a second name settles as whatever the holder
    /// left behind: a duplicate once acknowledged, a fresh claim after a
    /// skip. `None` when aborted while waiting.
    async fn claim_when_free(
        &self,
        identity: &Identity,
        candidate: &ExportCandidate,
        size: u64,
        abort: &CancellationToken,
    ) -> Result<Option<Claim>, PipelineError> {
        let mut waiting = false;
        loop {
            let released = self.index.released();
            match self.index.claim(identity, candidate, size)? {
                Claim::InFlight => {
                    if !waiting {
                        debug!(
                            identity = %identity.short(),
                            path = %candidate.source_path.display(),
                            "identity in flight elsewhere, waiting"
                        );
                        waiting = true;
                    }
                    tokio::select! {
                        _ = abort.cancelled() => return Ok(None),
                        _ = released => {}
                    }
                }
                claim => return Ok(Some(claim)),
            }
        }
    }

    async fn store_with_retry(
        &self,
        record: &IngestionRecord,
        abort: &CancellationToken,
    ) -> Result<Option<Stored>, StoreError> {
        let mut backoff = self.io_retry.initial_backoff;
        let mut attempt = 1;
        loop {
            let result = self
                .store
                .store(&record.source_path, &record.candidate_id, &record.original_name, record.size)
                .await;
            match result {
                Ok(stored) => return Ok(Some(stored)),
                Err(e) if e.is_transient() && attempt < self.io_retry.attempts => {
                    warn!(
                        identity = %record.candidate_id.short(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "storing failed, retrying"
                    );
                    tokio::select! {
                        _ = abort.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn deliver(
        &self,
        mut record: IngestionRecord,
        guard: ClaimGuard,
        candidate: &ExportCandidate,
        stored: Stored,
        abort: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let identity = record.candidate_id.clone();

        if record.stored_path.as_deref() != Some(stored.path.as_path())
            || record.status == RecordStatus::Pending
        {
            record.mark_stored(stored.path.clone());
            self.index.update(&record)?;
        }
        self.events
            .emit(
                Some(&identity),
                EventStage::Stored,
                if stored.reused { "reused stored copy" } else { "artifact stored" },
                json!({ "stored_path": stored.path, "size": record.size }),
            )
            .await;

        if abort.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let notice = notice_for(&record, candidate, &stored.path, record.attempts + 1);
        let index = &self.index;
        let mut unpersisted: Option<IndexError> = None;
        let result = self
            .deliverer
            .deliver(&notice, record.attempts, abort, |event| {
                match event {
                    AttemptEvent::Started { .. } => {
                        record.begin_attempt();
                    }
                    AttemptEvent::Failed { error, backoff, .. } => {
                        record.record_failure(
                            error.kind(),
                            error.to_string(),
                            backoff.map(|d| d.as_millis() as u64),
                        );
                    }
                }
                match index.update(&record) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        error!(identity = %record.candidate_id.short(), attempt = record.attempts, error = %e, "could not persist attempt");
                        unpersisted = Some(e);
                        ControlFlow::Break(())
                    }
                }
            })
            .await;

        if let Some(e) = unpersisted {
            return Err(PipelineError::Index(e));
        }
        match result {
            Ok(delivered) => {
                record.mark_acknowledged(delivered.ack.remote_id.clone());
                self.index.update(&record)?;
                drop(guard);
                PipelineCounters::bump(&self.counters.acknowledged);
                self.events
                    .emit(
                        Some(&identity),
                        EventStage::Acknowledged,
                        "ingestion acknowledged",
                        json!({ "attempts": delivered.attempts, "remote_id": delivered.ack.remote_id }),
                    )
                    .await;
                self.dispose(&record.source_path, &identity, true).await;
                Ok(Outcome::Acknowledged {
                    identity,
                    stored_path: stored.path,
                    attempts: delivered.attempts,
                })
            }
            Err(DeliveryError::Cancelled) => {
                info!(identity = %identity.short(), attempts = record.attempts, "delivery abandoned on shutdown");
                Ok(Outcome::Cancelled)
            }
            Err(e @ DeliveryError::Fatal(_)) => {
                self.events
                    .emit(
                        Some(&identity),
                        EventStage::Error,
                        e.to_string(),
                        json!({ "kind": e.kind(), "attempts": record.attempts }),
                    )
                    .await;
                Err(PipelineError::Fatal {
                    identity: identity.short().to_string(),
                    source: e,
                })
            }
            Err(e) => {
                let kind = e.kind();
                let message = match &e {
                    DeliveryError::Exhausted { last: Some(last), .. } => format!("{e}: {last}"),
                    _ => e.to_string(),
                };
                self.give_up(record, guard, kind, message).await
            }
        }
    }

    /// Mark the record failed and move the source aside when archiving.
    async fn give_up(
        &self,
        mut record: IngestionRecord,
        guard: ClaimGuard,
        kind: ErrorKind,
        message: String,
    ) -> Result<Outcome, PipelineError> {
        record.mark_failed(kind, message.clone());
        self.index.update(&record)?;
        drop(guard);
        PipelineCounters::bump(&self.counters.failed);

        let identity = record.candidate_id.clone();
        self.events
            .emit(
                Some(&identity),
                EventStage::Error,
                format!("ingestion failed: {message}"),
                json!({
                    "kind": kind,
                    "attempts": record.attempts,
                    "path": record.source_path,
                }),
            )
            .await;
        self.dispose(&record.source_path, &identity, false).await;

        Ok(Outcome::Failed {
            identity,
            kind,
            message,
        })
    }

    async fn dispose(&self, source: &Path, identity: &Identity, succeeded: bool) {
        let result = if succeeded {
            self.disposer.on_success(source, identity).await
        } else {
            self.disposer.on_failure(source, identity).await
        };
        match result {
            Ok(None) => {}
            Ok(Some(done)) => {
                let meta = match &done {
                    Disposed::Moved(to) => json!({ "from": source, "to": to }),
                    Disposed::Deleted => json!({ "from": source, "deleted": true }),
                };
                self.events
                    .emit(Some(identity), EventStage::Archived, "source disposed", meta)
                    .await;
            }
            Err(e) => {
                warn!(
                    identity = %identity.short(),
                    path = %source.display(),
                    disposition = %self.disposer.disposition(),
                    error = %e,
                    "source disposition failed"
                );
            }
        }
    }

    fn skip(&self, path: PathBuf, reason: &'static str) -> Outcome {
        PipelineCounters::bump(&self.counters.skipped);
        info!(path = %path.display(), reason, "candidate skipped");
        Outcome::Skipped { path, reason }
    }
}

async fn hash_file(path: &Path) -> Result<io::Result<(Identity, u64)>, PipelineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || Identity::of_file(&path))
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))
}

async fn changed_since(path: &Path, modified_at: DateTime<Utc>) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) != modified_at,
        Err(_) => true,
    }
}

fn notice_for(
    record: &IngestionRecord,
    candidate: &ExportCandidate,
    stored: &Path,
    attempt: u32,
) -> IngestionNotice {
    IngestionNotice {
        identity: record.candidate_id.clone(),
        stored_path: stored.display().to_string(),
        metadata: NoticeMetadata {
            original_name: record.original_name.clone(),
            size: record.size,
            mime: mime_for(&record.original_name).to_string(),
            source_path: candidate.source_path.display().to_string(),
            detected_at: candidate.detected_at,
            modified_at: candidate.modified_at,
            attempt,
        },
    }
}
