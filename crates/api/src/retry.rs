//! Bounded exponential-backoff delivery of ingestion notices.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use intake_core::config::RetrySettings;
use intake_core::ErrorKind;

use crate::traits::{Ack, ApiError, IngestApi, IngestionNotice};

/// Upper bound on the random component added to each delay.
const MAX_JITTER_MS: u64 = 100;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed per identity, counted across restarts.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Add up to 100 ms of jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap_ms = self.max_backoff.as_millis() as u64;
        let mut delay_ms = (base_ms as u64).min(cap_ms);

        if self.jitter {
            // Jitter without rand: nanosecond fraction of the current time.
            let jitter_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64
                % MAX_JITTER_MS;
            delay_ms = (delay_ms + jitter_ms).min(cap_ms);
        }

        Duration::from_millis(delay_ms)
    }

    /// Delay after `error`, honouring a server `Retry-After` up to the cap.
    fn delay_after(&self, attempt: u32, error: &ApiError) -> Duration {
        match error.retry_after() {
            Some(requested) => requested.min(self.max_backoff),
            None => self.backoff_for(attempt),
        }
    }
}

/// Progress reported to the caller while a delivery runs.
#[derive(Debug)]
pub enum AttemptEvent<'a> {
    /// Attempt `attempt` is about to be sent.
    Started { attempt: u32 },
    /// Attempt `attempt` failed; `backoff` is the wait before the next one,
    /// `None` when no further attempt will be made.
    Failed {
        attempt: u32,
        error: &'a ApiError,
        backoff: Option<Duration>,
    },
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub ack: Ack,
    /// Total attempts used for this identity, including earlier runs.
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Credential rejected or client misconfigured. The process must stop.
    #[error("fatal API error: {0}")]
    Fatal(ApiError),

    /// The API refused the notice; retrying will not help.
    #[error("notice rejected: {0}")]
    Rejected(ApiError),

    #[error("gave up after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        last: Option<ApiError>,
    },

    /// Abort requested while waiting to retry.
    #[error("delivery cancelled")]
    Cancelled,

    /// The observer asked to stop after `attempts` attempts.
    #[error("delivery stopped by caller after {attempts} attempts")]
    Interrupted { attempts: u32 },
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal(e) => e.kind(),
            Self::Rejected(_) => ErrorKind::PermanentValidation,
            Self::Exhausted { last, .. } => last
                .as_ref()
                .map(ApiError::kind)
                .unwrap_or(ErrorKind::TransientNetwork),
            Self::Cancelled => ErrorKind::TransientNetwork,
            Self::Interrupted { .. } => ErrorKind::TransientIo,
        }
    }
}

/// Sends notices through an [`IngestApi`] under a [`RetryPolicy`].
pub struct Deliverer {
    api: Arc<dyn IngestApi>,
    policy: RetryPolicy,
}

impl Deliverer {
    pub fn new(api: Arc<dyn IngestApi>, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn api(&self) -> &Arc<dyn IngestApi> {
        &self.api
    }

    /// Deliver `notice`, resuming after `already_attempted` earlier attempts.
    ///
    /// `observer` sees every attempt start and failure so the caller can
    /// persist them; returning `Break` stops delivery before the next
    /// request is sent. `abort` is only honoured between attempts; a
    /// request in progress runs to completion or to the client timeout.
    pub async fn deliver(
        &self,
        notice: &IngestionNotice,
        already_attempted: u32,
        abort: &CancellationToken,
        mut observer: impl FnMut(AttemptEvent<'_>) -> ControlFlow<()>,
    ) -> Result<Delivered, DeliveryError> {
        let max = self.policy.max_attempts;
        let mut attempt = already_attempted;
        let mut last: Option<ApiError> = None;

        loop {
            if attempt >= max {
                warn!(
                    identity = %notice.identity.short(),
                    attempts = attempt,
                    "attempt ceiling reached"
                );
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    last,
                });
            }
            if abort.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            attempt += 1;
            if observer(AttemptEvent::Started { attempt }).is_break() {
                return Err(DeliveryError::Interrupted {
                    attempts: attempt - 1,
                });
            }
            debug!(
                identity = %notice.identity.short(),
                attempt,
                max,
                endpoint = self.api.endpoint(),
                "sending ingestion notice"
            );

            let error = match self.api.notify(&notice.with_attempt(attempt)).await {
                Ok(ack) => {
                    info!(
                        identity = %notice.identity.short(),
                        attempt,
                        status = ack.status,
                        "ingestion delivered"
                    );
                    return Ok(Delivered {
                        ack,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            let fatal = error.kind().is_fatal();
            let retryable = !fatal && error.is_retryable();
            let backoff = (retryable && attempt < max).then(|| self.policy.delay_after(attempt, &error));
            let flow = observer(AttemptEvent::Failed {
                attempt,
                error: &error,
                backoff,
            });
            if flow.is_break() {
                return Err(DeliveryError::Interrupted { attempts: attempt });
            }
            if fatal {
                return Err(DeliveryError::Fatal(error));
            }
            if !retryable {
                return Err(DeliveryError::Rejected(error));
            }

            warn!(
                identity = %notice.identity.short(),
                attempt,
                max,
                error = %error,
                backoff_ms = backoff.map(|d| d.as_millis() as u64),
                "ingestion notice failed"
            );
            last = Some(error);

            if let Some(delay) = backoff {
                tokio::select! {
                    _ = abort.cancelled() => return Err(DeliveryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
