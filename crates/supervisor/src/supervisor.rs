//! Runs a [`Worker`] with heartbeats, graceful draining and bounded restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use intake_core::config::SupervisorSettings;

use crate::error::{SupervisorError, WorkerError};
use crate::state::{StateHandle, WorkerState};
use crate::worker::{RunContext, Worker};

/// How long a worker gets to return after its abort token fires.
const ABORT_SETTLE: Duration = Duration::from_secs(5);

// ── SupervisorBuilder ────────────────────────────────────────────────

/// Fluent builder for a [`Supervisor`].
///
/// # Example
/// ```ignore
/// let supervisor = SupervisorBuilder::new("ingest-worker")
///     .max_restarts(3)
///     .shutdown_grace(Duration::from_secs(10))
///     .build();
/// supervisor.run(worker).await?;
/// ```
pub struct SupervisorBuilder {
    name: String,
    max_restarts: u32,
    restart_backoff: Duration,
    shutdown_grace: Duration,
    health_interval: Duration,
    stability_window: Duration,
    handle_signals: bool,
}

impl SupervisorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_restarts: 3,
            restart_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            health_interval: Duration::from_secs(60),
            stability_window: Duration::from_secs(60),
            handle_signals: true,
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &SupervisorSettings) -> Self {
        Self::new(name)
            .max_restarts(settings.max_restarts)
            .restart_backoff(settings.restart_backoff)
            .shutdown_grace(settings.shutdown_grace)
            .health_interval(settings.health_interval)
    }

    /// Consecutive crashes tolerated before the worker is declared failed (default: 3).
    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    /// Delay before restarting a crashed worker (default: 1s).
    pub fn restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    /// Time in-flight work gets to finish after shutdown is requested (default: 10s).
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Interval between heartbeat logs (default: 60s).
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// A run that lasts this long resets the crash counter (default: 60s).
    pub fn stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    /// Listen for SIGINT/SIGTERM (default: true).
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn build(self) -> Supervisor {
        Supervisor {
            state: Arc::new(StateHandle::new(self.name.clone())),
            shutdown: CancellationToken::new(),
            config: self,
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

/// Owns one worker's lifecycle.
///
/// The supervisor manages three concurrent concerns:
/// 1. **Heartbeat** — logs the worker's state and counters at an interval
/// 2. **Signals** — SIGINT/SIGTERM (or [`Supervisor::shutdown`]) start draining
/// 3. **Restarts** — a crashed run is restarted after a backoff until the
///    consecutive-crash ceiling is hit
pub struct Supervisor {
    config: SupervisorBuilder,
    state: Arc<StateHandle>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> WorkerState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Token that requests a graceful stop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run `worker` until it stops cleanly or fails for good.
    pub async fn run(&self, worker: Arc<dyn Worker>) -> Result<(), SupervisorError> {
        let name = self.config.name.clone();
        info!(worker = %name, "supervisor starting");

        let signal_handle = self.config.handle_signals.then(|| {
            let shutdown = self.shutdown.clone();
            let sig_name = name.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = os_signal() => {
                        info!(worker = %sig_name, "shutdown signal received");
                        shutdown.cancel();
                    }
                    _ = shutdown.cancelled() => {}
                }
            })
        });

        let health_handle = {
            let worker = Arc::clone(&worker);
            let state = Arc::clone(&self.state);
            let interval = self.config.health_interval;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { health_loop(worker, state, interval, shutdown).await })
        };

        let result = self.supervise(&*worker).await;

        health_handle.abort();
        if let Some(handle) = signal_handle {
            handle.abort();
        }

        match &result {
            Ok(()) => info!(worker = %name, "supervisor finished"),
            Err(e) => error!(worker = %name, error = %e, "supervisor gave up"),
        }
        result
    }

    async fn supervise(&self, worker: &dyn Worker) -> Result<(), SupervisorError> {
        let name = &self.config.name;
        let mut crashes: u32 = 0;

        loop {
            let started = Instant::now();
            let outcome = self.run_once(worker).await;

            let err = match outcome {
                Ok(()) => {
                    self.state.transition(WorkerState::Stopped);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    self.state.transition(WorkerState::Failed);
                    return Err(SupervisorError::Fatal {
                        worker: name.clone(),
                        source: e,
                    });
                }
                Err(e) => e,
            };

            if self.shutdown.is_cancelled() {
                warn!(worker = %name, error = %err, "worker failed while draining");
                self.state.transition(WorkerState::Stopped);
                return Ok(());
            }

            if started.elapsed() >= self.config.stability_window {
                crashes = 0;
            }
            crashes += 1;
            self.state.transition(WorkerState::Crashed);
            error!(
                worker = %name,
                error = %err,
                crashes,
                max_restarts = self.config.max_restarts,
                "worker crashed"
            );

            if crashes > self.config.max_restarts {
                self.state.transition(WorkerState::Failed);
                return Err(SupervisorError::RestartsExhausted {
                    worker: name.clone(),
                    crashes,
                    last: err,
                });
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.state.transition(WorkerState::Stopped);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.restart_backoff) => {}
            }
            info!(worker = %name, attempt = crashes, "restarting worker");
        }
    }

    /// One worker run, including draining when shutdown fires mid-run.
    async fn run_once(&self, worker: &dyn Worker) -> Result<(), WorkerError> {
        self.state.transition(WorkerState::Starting);
        let abort = CancellationToken::new();
        let ctx = RunContext::new(self.shutdown.clone(), abort.clone(), Arc::clone(&self.state));

        let run = worker.run(ctx);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = self.shutdown.cancelled() => {}
        }

        self.state.transition(WorkerState::Draining);
        let grace = self.config.shutdown_grace;
        info!(worker = %self.config.name, grace_secs = grace.as_secs_f64(), "draining in-flight work");

        if let Ok(result) = tokio::time::timeout(grace, &mut run).await {
            return result;
        }

        warn!(worker = %self.config.name, "grace deadline passed, aborting in-flight work");
        abort.cancel();
        match tokio::time::timeout(ABORT_SETTLE, &mut run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(worker = %self.config.name, "worker ignored abort, abandoning it");
                Ok(())
            }
        }
    }
}

/// Periodically log worker counters until shutdown.
async fn health_loop(
    worker: Arc<dyn Worker>,
    state: Arc<StateHandle>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = worker.health();
                info!(
                    worker = worker.name(),
                    state = state.current().as_str(),
                    queued = health.queued,
                    in_flight = health.in_flight,
                    acknowledged = health.acknowledged,
                    duplicates = health.duplicates,
                    failed = health.failed,
                    "heartbeat"
                );
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use intake_core::ErrorKind;

    /// What a scripted run does.
    #[derive(Clone, Copy)]
    enum Step {
        /// Mark watching, then wait for shutdown.
        Serve,
        /// Crash right away.
        Crash,
        /// Fail with an auth error.
        Fatal,
        /// Mark watching, then finish by itself.
        Finish,
        /// Ignore shutdown; only stop on abort.
        Stubborn,
    }

    struct ScriptedWorker {
        steps: Mutex<Vec<Step>>,
        runs: AtomicU32,
        aborted: AtomicU32,
    }

    impl ScriptedWorker {
        fn new(mut steps: Vec<Step>) -> Arc<Self> {
            steps.reverse();
            Arc::new(Self {
                steps: Mutex::new(steps),
                runs: AtomicU32::new(0),
                aborted: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Worker for ScriptedWorker {
        async fn run(&self, ctx: RunContext) -> Result<(), WorkerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop().unwrap_or(Step::Serve);
            match step {
                Step::Serve => {
                    ctx.mark_watching();
                    ctx.shutdown.cancelled().await;
                    Ok(())
                }
                Step::Crash => Err(WorkerError::crashed("watch directory vanished")),
                Step::Fatal => Err(WorkerError::from_kind(ErrorKind::Auth, "401 from API")),
                Step::Finish => {
                    ctx.mark_watching();
                    Ok(())
                }
                Step::Stubborn => {
                    ctx.mark_watching();
                    ctx.abort.cancelled().await;
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn supervisor() -> Supervisor {
        SupervisorBuilder::new("scripted")
            .max_restarts(3)
            .restart_backoff(Duration::from_millis(100))
            .shutdown_grace(Duration::from_secs(2))
            .health_interval(Duration::from_millis(50))
            .handle_signals(false)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn clean_shutdown_drains_and_stops() {
        let worker = ScriptedWorker::new(vec![Step::Serve]);
        let supervisor = Arc::new(supervisor());
        let mut states = supervisor.subscribe();

        let s = Arc::clone(&supervisor);
        let w: Arc<dyn Worker> = worker.clone();
        let handle = tokio::spawn(async move { s.run(w).await });

        states
            .wait_for(|s| *s == WorkerState::Watching)
            .await
            .unwrap();
        supervisor.shutdown();

        handle.await.unwrap().unwrap();
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_pass_worker_stops_by_itself() {
        let worker = ScriptedWorker::new(vec![Step::Finish]);
        let supervisor = supervisor();
        supervisor.run(worker.clone()).await.unwrap();
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_are_restarted() {
        let worker = ScriptedWorker::new(vec![Step::Crash, Step::Crash, Step::Finish]);
        let supervisor = supervisor();
        supervisor.run(worker.clone()).await.unwrap();
        assert_eq!(worker.runs.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_ceiling_reports_failed() {
        let worker = ScriptedWorker::new(vec![Step::Crash; 10]);
        let supervisor = supervisor();
        let err = supervisor.run(worker.clone()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::RestartsExhausted { crashes: 4, .. }));
        assert_eq!(err.kind(), ErrorKind::SupervisorCrash);
        assert_eq!(worker.runs.load(Ordering::SeqCst), 4);
        assert_eq!(supervisor.state(), WorkerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_restarted() {
        let worker = ScriptedWorker::new(vec![Step::Fatal]);
        let supervisor = supervisor();
        let err = supervisor.run(worker.clone()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Fatal { .. }));
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), WorkerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_deadline_fires_abort() {
        let worker = ScriptedWorker::new(vec![Step::Stubborn]);
        let supervisor = Arc::new(supervisor());
        let mut states = supervisor.subscribe();

        let s = Arc::clone(&supervisor);
        let w: Arc<dyn Worker> = worker.clone();
        let handle = tokio::spawn(async move { s.run(w).await });

        states
            .wait_for(|s| *s == WorkerState::Watching)
            .await
            .unwrap();
        let requested = Instant::now();
        supervisor.shutdown();
        handle.await.unwrap().unwrap();

        assert!(requested.elapsed() >= Duration::from_secs(2));
        assert_eq!(worker.aborted.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[test]
    fn builder_defaults() {
        let supervisor = SupervisorBuilder::new("default").build();
        assert_eq!(supervisor.name(), "default");
        assert_eq!(supervisor.config.max_restarts, 3);
        assert_eq!(supervisor.config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(supervisor.state(), WorkerState::Starting);
    }
}
