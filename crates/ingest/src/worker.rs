//! The supervised ingest worker: one watcher, a bounded queue, and a
//! semaphore-limited set of pipeline tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use intake_core::{ExportCandidate, IngestionRecord, Settings};
use intake_supervisor::{RunContext, Worker, WorkerError, WorkerHealth};
use intake_watch::{source_for, DirectoryWatcher, EventSource};

use crate::error::PipelineError;
use crate::pipeline::{IngestPipeline, Outcome};

type SourceFactory = Box<dyn Fn() -> Box<dyn EventSource> + Send + Sync>;
type TaskResult = Result<Outcome, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Watch until shut down.
    Continuous,
    /// Ingest what is in the directory now, then stop.
    Once,
}

pub struct IntakeWorker {
    name: String,
    settings: Arc<Settings>,
    pipeline: Arc<IngestPipeline>,
    mode: RunMode,
    source_factory: Option<SourceFactory>,
    in_flight: Arc<AtomicUsize>,
    queue: Mutex<Option<mpsc::WeakSender<ExportCandidate>>>,
}

impl IntakeWorker {
    pub fn new(settings: Arc<Settings>, pipeline: Arc<IngestPipeline>, mode: RunMode) -> Self {
        Self {
            name: "ingest-worker".to_string(),
            settings,
            pipeline,
            mode,
            source_factory: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            queue: Mutex::new(None),
        }
    }

    /// Use a custom event source for every run instead of the configured one.
    pub fn with_source_factory(
        mut self,
        factory: impl Fn() -> Box<dyn EventSource> + Send + Sync + 'static,
    ) -> Self {
        self.source_factory = Some(Box::new(factory));
        self
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    fn watcher(&self) -> DirectoryWatcher {
        let source = match &self.source_factory {
            Some(factory) => factory(),
            None => source_for(self.settings.watch()),
        };
        DirectoryWatcher::new(self.settings.watch_dir(), self.settings.watch().clone(), source)
    }

    fn concurrency(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.settings.pipeline().concurrency))
    }

    fn spawn_candidate(
        &self,
        tasks: &mut JoinSet<TaskResult>,
        permit: OwnedSemaphorePermit,
        candidate: ExportCandidate,
        abort: &CancellationToken,
    ) {
        let pipeline = Arc::clone(&self.pipeline);
        let abort = abort.clone();
        let slot = InFlightSlot::enter(&self.in_flight);
        tasks.spawn(async move {
            let _permit = permit;
            let _slot = slot;
            pipeline.process(candidate, &abort).await
        });
    }

    fn spawn_resume(
        &self,
        tasks: &mut JoinSet<TaskResult>,
        limit: &Arc<Semaphore>,
        record: IngestionRecord,
        abort: &CancellationToken,
    ) {
        let pipeline = Arc::clone(&self.pipeline);
        let limit = Arc::clone(limit);
        let abort = abort.clone();
        let in_flight = Arc::clone(&self.in_flight);
        tasks.spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                return Ok(Outcome::Cancelled);
            };
            let _slot = InFlightSlot::enter(&in_flight);
            pipeline.resume(record, &abort).await
        });
    }

    fn spawn_stranded(&self, tasks: &mut JoinSet<TaskResult>, limit: &Arc<Semaphore>, abort: &CancellationToken) {
        let stranded = self.pipeline.stranded();
        if !stranded.is_empty() {
            info!(count = stranded.len(), "resuming stored ingestions whose source is gone");
        }
        for record in stranded {
            self.spawn_resume(tasks, limit, record, abort);
        }
    }

    async fn run_continuous(&self, ctx: RunContext) -> Result<(), WorkerError> {
        let (tx, mut rx) = mpsc::channel(self.settings.pipeline().queue_capacity);
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.downgrade());

        let watch_stop = ctx.shutdown.child_token();
        let mut watch_task = tokio::spawn(self.watcher().run(tx, watch_stop.clone()));
        let mut watch_done = false;

        let limit = self.concurrency();
        let mut tasks = JoinSet::new();
        ctx.mark_watching();
        self.spawn_stranded(&mut tasks, &limit, &ctx.abort);

        let mut failure: Option<WorkerError> = None;
        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = reap(joined) {
                        failure = Some(e);
                        break;
                    }
                }
                watched = &mut watch_task => {
                    watch_done = true;
                    failure = match watched {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => {
                            error!(error = %e, "directory watcher stopped");
                            Some(WorkerError::from_kind(e.kind(), e.to_string()))
                        }
                        Err(e) => Some(WorkerError::crashed(format!("watcher task failed: {e}"))),
                    };
                    break;
                }
                next = rx.recv() => {
                    let Some(candidate) = next else { break };
                    let permit = tokio::select! {
                        biased;
                        _ = ctx.shutdown.cancelled() => None,
                        permit = Arc::clone(&limit).acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = permit else { break };
                    debug!(path = %candidate.source_path.display(), "candidate dispatched");
                    self.spawn_candidate(&mut tasks, permit, candidate, &ctx.abort);
                }
            }
        }

        watch_stop.cancel();
        drop(rx);
        if !watch_done {
            if let Ok(Err(e)) = watch_task.await {
                warn!(error = %e, "directory watcher ended with an error during shutdown");
            }
        }
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = None;

        if let Err(e) = drain(&mut tasks, &ctx.abort).await {
            failure.get_or_insert(e);
        }
        failure.map_or(Ok(()), Err)
    }

    async fn run_once(&self, ctx: RunContext) -> Result<(), WorkerError> {
        let mut watcher = self.watcher();
        ctx.mark_watching();
        let candidates = watcher
            .collect_stable(&ctx.shutdown)
            .await
            .map_err(|e| WorkerError::from_kind(e.kind(), e.to_string()))?;
        info!(count = candidates.len(), "single pass: candidates ready");

        let limit = self.concurrency();
        let mut tasks = JoinSet::new();
        self.spawn_stranded(&mut tasks, &limit, &ctx.abort);

        let mut failure = None;
        for candidate in candidates {
            let permit = tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => None,
                permit = Arc::clone(&limit).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else { break };
            self.spawn_candidate(&mut tasks, permit, candidate, &ctx.abort);

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = reap(joined) {
                    failure = Some(e);
                }
            }
            if failure.is_some() {
                break;
            }
        }

        if let Err(e) = drain(&mut tasks, &ctx.abort).await {
            failure.get_or_insert(e);
        }
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Worker for IntakeWorker {
    async fn run(&self, ctx: RunContext) -> Result<(), WorkerError> {
        match self.mode {
            RunMode::Continuous => self.run_continuous(ctx).await,
            RunMode::Once => self.run_once(ctx).await,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn health(&self) -> WorkerHealth {
        let queued = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);
        let counters = self.pipeline.counters();
        WorkerHealth {
            queued,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            acknowledged: counters.acknowledged(),
            duplicates: counters.duplicates(),
            failed: counters.failed(),
        }
    }
}

/// Counts a running pipeline task; released even when the task is aborted.
struct InFlightSlot(Arc<AtomicUsize>);

impl InFlightSlot {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn reap(joined: Result<TaskResult, JoinError>) -> Result<(), WorkerError> {
    match joined {
        Ok(Ok(outcome)) => {
            debug!(?outcome, "ingestion finished");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, kind = %e.kind(), "ingestion stopped the worker");
            Err(WorkerError::from_kind(e.kind(), e.to_string()))
        }
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(WorkerError::crashed(format!("ingestion task panicked: {e}"))),
    }
}

/// Wait for in-flight work; abandon it once `abort` fires.
async fn drain(tasks: &mut JoinSet<TaskResult>, abort: &CancellationToken) -> Result<(), WorkerError> {
    if !tasks.is_empty() {
        info!(in_flight = tasks.len(), "waiting for in-flight ingestions");
    }
    let mut failure = None;
    loop {
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                if !tasks.is_empty() {
                    warn!(abandoned = tasks.len(), "grace period over, abandoning in-flight ingestions");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                }
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(joined) => {
                    if let Err(e) = reap(joined) {
                        failure.get_or_insert(e);
                    }
                }
                None => break,
            },
        }
    }
    failure.map_or(Ok(()), Err)
}
