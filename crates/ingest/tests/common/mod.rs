#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use intake_api::{
    Ack, ApiError, Deliverer, EventReporter, EventStage, IngestApi, IngestEvent, IngestionNotice,
    RetryPolicy,
};
use intake_core::{ExportCandidate, Settings, SourceDisposition};
use intake_index::IngestionIndex;
use intake_ingest::{ContentStore, Disposer, IngestPipeline, IoRetry};

type NotifyHook = Box<dyn FnOnce() + Send>;

/// Scripted stand-in for the remote ingestion API.
#[derive(Default)]
pub struct FakeApi {
    script: Mutex<VecDeque<u16>>,
    fallback: Mutex<Option<u16>>,
    notices: Mutex<Vec<IngestionNotice>>,
    events: Mutex<Vec<IngestEvent>>,
    on_notify: Mutex<Option<NotifyHook>>,
    notify_delay: Mutex<Duration>,
    stall_events: Mutex<bool>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Statuses returned in order; afterwards the fallback (200 unless set).
    pub fn script(&self, statuses: &[u16]) {
        self.script.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn always(&self, status: u16) {
        *self.fallback.lock().unwrap() = Some(status);
    }

    /// Run `hook` as the next notice arrives, before answering it.
    pub fn on_notify(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_notify.lock().unwrap() = Some(Box::new(hook));
    }

    /// Cancel `token` as the next notice arrives.
    pub fn cancel_on_notify(&self, token: CancellationToken) {
        self.on_notify(move || token.cancel());
    }

    /// Hold every notice this long before answering.
    pub fn slow_notify(&self, delay: Duration) {
        *self.notify_delay.lock().unwrap() = delay;
    }

    /// Never answer event reports.
    pub fn stall_events(&self) {
        *self.stall_events.lock().unwrap() = true;
    }

    pub fn notices(&self) -> Vec<IngestionNotice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<EventStage> {
        self.events.lock().unwrap().iter().map(|e| e.stage).collect()
    }

    /// Stages once at least `count` events have been forwarded.
    pub async fn wait_for_stages(&self, count: usize) -> Vec<EventStage> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stages = self.stages();
                if stages.len() >= count {
                    return stages;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stage events not forwarded in time")
    }
}

#[async_trait::async_trait]
impl IngestApi for FakeApi {
    async fn notify(&self, notice: &IngestionNotice) -> Result<Ack, ApiError> {
        let count = {
            let mut notices = self.notices.lock().unwrap();
            notices.push(notice.clone());
            notices.len()
        };
        let hook = self.on_notify.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let delay = *self.notify_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let status = scripted
            .or(*self.fallback.lock().unwrap())
            .unwrap_or(200);
        match status {
            200 | 201 => Ok(Ack {
                status,
                remote_id: Some(format!("ing-{count}")),
            }),
            401 | 403 => Err(ApiError::Auth { status }),
            429 => Err(ApiError::RateLimited {
                retry_after_secs: None,
            }),
            500..=599 => Err(ApiError::Server {
                status,
                body: "unavailable".into(),
            }),
            _ => Err(ApiError::Rejected {
                status,
                body: "invalid".into(),
            }),
        }
    }

    async fn report_event(&self, event: &IngestEvent) -> Result<(), ApiError> {
        self.events.lock().unwrap().push(event.clone());
        let stalled = *self.stall_events.lock().unwrap();
        if stalled {
            future::pending::<()>().await;
        }
        Ok(())
    }

    fn endpoint(&self) -> &str {
        "fake://ingestions"
    }
}

pub fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
        jitter: false,
    }
}

/// Watch directory, storage root and index on scratch disk.
pub struct Fixture {
    pub watch: TempDir,
    pub storage: TempDir,
    pub api: Arc<FakeApi>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            watch: tempfile::tempdir().unwrap(),
            storage: tempfile::tempdir().unwrap(),
            api: FakeApi::new(),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        self.watch.path()
    }

    pub fn storage_root(&self) -> &Path {
        self.storage.path()
    }

    /// Open the index from disk, as a fresh process would.
    pub fn open_index(&self) -> Arc<IngestionIndex> {
        Arc::new(IngestionIndex::open(self.storage_root().join(".intake-index")).unwrap())
    }

    pub fn pipeline(
        &self,
        index: &Arc<IngestionIndex>,
        disposition: SourceDisposition,
        max_attempts: u32,
    ) -> IngestPipeline {
        let api: Arc<dyn IngestApi> = self.api.clone();
        IngestPipeline::new(
            Arc::clone(index),
            ContentStore::new(self.storage_root()),
            Deliverer::new(Arc::clone(&api), policy(max_attempts)),
            EventReporter::new(api, true),
            Disposer::new(self.watch_dir(), disposition, "_Processed", "_Failed"),
        )
        .with_io_retry(IoRetry {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
        })
    }

    /// Write an export and describe it the way the watcher would once stable.
    pub fn export(&self, name: &str, body: &[u8]) -> ExportCandidate {
        let path = self.watch_dir().join(name);
        fs::write(&path, body).unwrap();
        candidate_for(&path)
    }

    /// Settings pointing at the fixture, in poll mode with short intervals.
    pub fn settings(&self, extra: &[(&str, &str)]) -> Settings {
        let mut vars: Vec<(String, String)> = vec![
            ("API_BASE".into(), "http://127.0.0.1:9/api".into()),
            ("CCC_EXPORT_WATCH".into(), self.watch_dir().display().to_string()),
            ("STORAGE_ROOT".into(), self.storage_root().display().to_string()),
            ("WORKER_JWT".into(), "test-token".into()),
            ("INGEST_WATCH_MODE".into(), "poll".into()),
            ("INGEST_QUIESCENCE_MS".into(), "100".into()),
            ("INGEST_POLL_INTERVAL_MS".into(), "20".into()),
        ];
        for (k, v) in extra {
            vars.push((k.to_string(), v.to_string()));
        }
        Settings::from_lookup(|key| {
            vars.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }
}

pub fn candidate_for(path: &Path) -> ExportCandidate {
    let meta = fs::metadata(path).unwrap();
    let modified: DateTime<Utc> = meta.modified().unwrap().into();
    let mut candidate = ExportCandidate::new(PathBuf::from(path), meta.len(), modified);
    candidate.stability_confirmed = true;
    candidate
}

/// Files (not directories) directly under `dir`, hidden ones included.
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}
