//! Best-effort pipeline stage events.
//!
//! Every stage is logged through `tracing`. When reporting is enabled the
//! event is queued for a background forwarder that posts it to
//! `{API_BASE}/ingest/events`. Ingestion never waits on the post: a full
//! queue drops the event, and a slow or failed post is logged and ignored.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use intake_core::Identity;

use crate::traits::{EventStage, IngestApi, IngestEvent};

/// Events waiting for the forwarder before new ones are dropped.
const QUEUE_CAPACITY: usize = 256;

/// Upper bound on a single event post.
const POST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct EventReporter {
    api: Arc<dyn IngestApi>,
    enabled: bool,
    post_timeout: Duration,
    queue: Arc<OnceLock<mpsc::Sender<IngestEvent>>>,
}

impl EventReporter {
    pub fn new(api: Arc<dyn IngestApi>, enabled: bool) -> Self {
        Self {
            api,
            enabled,
            post_timeout: POST_TIMEOUT,
            queue: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_post_timeout(mut self, timeout: Duration) -> Self {
        self.post_timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn emit(
        &self,
        identity: Option<&Identity>,
        stage: EventStage,
        message: impl Into<String>,
        meta: Value,
    ) {
        let message = message.into();
        let short = identity.map(Identity::short).unwrap_or("-");
        if stage == EventStage::Error {
            tracing::warn!(identity = short, stage = stage.as_str(), %meta, "{message}");
        } else {
            tracing::info!(identity = short, stage = stage.as_str(), %meta, "{message}");
        }

        if !self.enabled {
            return;
        }

        let event = IngestEvent {
            identity: identity.cloned(),
            stage,
            message,
            meta,
        };
        if let Err(e) = self.forwarder().try_send(event) {
            tracing::debug!(stage = stage.as_str(), error = %e, "event queue full, dropping event");
        }
    }

    /// Sender to the forwarder task, started on first use.
    fn forwarder(&self) -> &mpsc::Sender<IngestEvent> {
        self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            tokio::spawn(forward(Arc::clone(&self.api), rx, self.post_timeout));
            tx
        })
    }
}

/// Post queued events in order until every reporter clone is gone.
async fn forward(api: Arc<dyn IngestApi>, mut rx: mpsc::Receiver<IngestEvent>, post_timeout: Duration) {
    while let Some(event) = rx.recv().await {
        let stage = event.stage.as_str();
        match tokio::time::timeout(post_timeout, api.report_event(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(stage, error = %e, "event report failed"),
            Err(_) => tracing::debug!(stage, timeout_ms = post_timeout.as_millis() as u64, "event report timed out"),
        }
    }
}
