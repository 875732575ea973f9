use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Load an explicitly requested dotenv file. Unlike [`load_dotenv`], a
/// missing or malformed file is an error.
pub fn load_dotenv_from(path: &Path) -> Result<(), ConfigError> {
    dotenvy::from_path(path).map_err(|e| ConfigError::EnvFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// ── Env reader ────────────────────────────────────────────────

/// Reads keys through a lookup function, honouring the active profile:
/// `{PROFILE}_{KEY}` is tried first, falling back to `{KEY}`.
struct EnvReader<'a> {
    profile: String,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvReader<'a> {
    fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        let profile = lookup("INTAKE_PROFILE")
            .map(|p| p.trim().to_uppercase())
            .unwrap_or_default();
        Self { profile, lookup }
    }

    /// Raw value, empty strings included.
    fn raw(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = (self.lookup)(&prefixed) {
                return Some(v);
            }
        }
        (self.lookup)(key)
    }

    fn opt(&self, key: &str) -> Option<String> {
        self.raw(key).filter(|s| !s.trim().is_empty())
    }

    /// Required core field: defaulted when unset, rejected when set but blank.
    fn required(&self, key: &'static str, default: &str) -> Result<String, ConfigError> {
        match self.raw(key) {
            Some(v) if v.trim().is_empty() => Err(ConfigError::Empty { key }),
            Some(v) => Ok(v.trim().to_string()),
            None => Ok(default.to_string()),
        }
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.opt(key) {
            Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: v.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.opt(key) {
            None => Ok(default),
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: v,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    /// Positive integer; zero is rejected.
    fn positive(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        let value: usize = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }
}

// ── Credential ────────────────────────────────────────────────

/// Bearer token for the remote API. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building the `Authorization` header only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

// ── Enums ─────────────────────────────────────────────────────

/// How the watch directory is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native filesystem notifications.
    Notify,
    /// Periodic directory snapshots (network shares).
    Poll,
}

impl FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notify" | "native" => Ok(Self::Notify),
            "poll" | "polling" => Ok(Self::Poll),
            other => Err(format!("unknown watch mode '{other}', expected notify or poll")),
        }
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify => f.write_str("notify"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

/// What happens to a source file once it is stored and acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDisposition {
    /// Leave it in place; identity dedup prevents reprocessing.
    Leave,
    /// Remove it from the watch directory.
    Delete,
    /// Move it under the processed (or failed) sub-directory.
    Archive,
}

impl FromStr for SourceDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leave" | "keep" => Ok(Self::Leave),
            "delete" | "remove" => Ok(Self::Delete),
            "archive" | "move" => Ok(Self::Archive),
            other => Err(format!(
                "unknown disposition '{other}', expected leave, delete or archive"
            )),
        }
    }
}

impl fmt::Display for SourceDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leave => f.write_str("leave"),
            Self::Delete => f.write_str("delete"),
            Self::Archive => f.write_str("archive"),
        }
    }
}

// ── Sub-configs ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub mode: WatchMode,
    /// A file must keep the same size and mtime for this long.
    pub quiescence: Duration,
    /// Cadence of stability re-checks (and of snapshots in poll mode).
    pub poll_interval: Duration,
    /// Suffixes of partially written files that are never ingested.
    pub ignore_suffixes: Vec<String>,
    /// Consecutive failed accessibility checks before the watcher gives up.
    pub unavailable_threshold: u32,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            mode: WatchMode::Notify,
            quiescence: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(1000),
            ignore_suffixes: default_ignore_suffixes(),
            unavailable_threshold: 3,
        }
    }
}

fn default_ignore_suffixes() -> Vec<String> {
    [".part", ".tmp", ".crdownload"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub disposition: SourceDisposition,
    pub processed_dir: String,
    pub failed_dir: String,
    pub report_events: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            concurrency: 4,
            disposition: SourceDisposition::Leave,
            processed_dir: "_Processed".to_string(),
            failed_dir: "_Failed".to_string(),
            report_events: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Ceiling on remote notification attempts per identity.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(30_000),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub shutdown_grace: Duration,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub health_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
            max_restarts: 3,
            restart_backoff: Duration::from_millis(1000),
            health_interval: Duration::from_secs(60),
        }
    }
}

// ── Settings ──────────────────────────────────────────────────

pub const DEFAULT_API_BASE: &str = "http://localhost:4000/api";
pub const DEFAULT_WATCH_DIR: &str = "/path/to/CCC_Exports";
pub const DEFAULT_STORAGE_ROOT: &str = "/path/to/Claims";
pub const DEFAULT_JWT: &str = "dev-token";

/// Index directory name under the storage root when `INGEST_INDEX_DIR` is unset.
pub const DEFAULT_INDEX_DIR_NAME: &str = ".intake-index";

/// Process-wide worker configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    profile: String,
    api_base: Url,
    watch_dir: PathBuf,
    storage_root: PathBuf,
    credential: Credential,
    index_dir: PathBuf,
    watch: WatchSettings,
    pipeline: PipelineSettings,
    retry: RetrySettings,
    supervisor: SupervisorSettings,
}

impl Settings {
    /// Build settings from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    ///
    /// The watch directory must already exist; the storage root (and the
    /// index directory) are created when missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader::new(&lookup);

        let api_base = parse_api_base(&env.required("API_BASE", DEFAULT_API_BASE)?)?;
        let watch_dir = PathBuf::from(env.required("CCC_EXPORT_WATCH", DEFAULT_WATCH_DIR)?);
        let storage_root = PathBuf::from(env.required("STORAGE_ROOT", DEFAULT_STORAGE_ROOT)?);
        let credential = Credential::new(env.required("WORKER_JWT", DEFAULT_JWT)?);

        let watch_dir = resolve_watch_dir(&watch_dir)?;
        let storage_root = resolve_storage_root(&storage_root)?;
        if watch_dir == storage_root {
            return Err(ConfigError::SamePath(watch_dir));
        }

        let index_dir = env
            .opt("INGEST_INDEX_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_root.join(DEFAULT_INDEX_DIR_NAME));

        let watch = WatchSettings {
            mode: env.parse("INGEST_WATCH_MODE", WatchMode::Notify)?,
            quiescence: env.millis("INGEST_QUIESCENCE_MS", 3000)?,
            poll_interval: env.millis("INGEST_POLL_INTERVAL_MS", 1000)?,
            ignore_suffixes: env
                .opt("INGEST_IGNORE_SUFFIXES")
                .map(|raw| split_list(&raw))
                .unwrap_or_else(default_ignore_suffixes),
            unavailable_threshold: env.parse("INGEST_UNAVAILABLE_THRESHOLD", 3)?,
        };

        let pipeline = PipelineSettings {
            queue_capacity: env.positive("INGEST_QUEUE_CAPACITY", 64)?,
            concurrency: env.positive("INGEST_CONCURRENCY", 4)?,
            disposition: env.parse("INGEST_SOURCE_DISPOSITION", SourceDisposition::Leave)?,
            processed_dir: env.or("INGEST_PROCESSED_DIR", "_Processed"),
            failed_dir: env.or("INGEST_FAILED_DIR", "_Failed"),
            report_events: env.flag("INGEST_REPORT_EVENTS", false)?,
        };

        let retry = RetrySettings {
            max_attempts: env.positive("INGEST_MAX_ATTEMPTS", 5)? as u32,
            initial_backoff: env.millis("INGEST_BACKOFF_INITIAL_MS", 500)?,
            max_backoff: env.millis("INGEST_BACKOFF_MAX_MS", 30_000)?,
            request_timeout: env.secs("INGEST_REQUEST_TIMEOUT_SECS", 30)?,
        };

        let supervisor = SupervisorSettings {
            shutdown_grace: env.secs("INGEST_SHUTDOWN_GRACE_SECS", 10)?,
            max_restarts: env.parse("INGEST_MAX_RESTARTS", 3)?,
            restart_backoff: env.millis("INGEST_RESTART_BACKOFF_MS", 1000)?,
            health_interval: env.secs("INGEST_HEALTH_INTERVAL_SECS", 60)?,
        };

        Ok(Self {
            profile: env.profile.clone(),
            api_base,
            watch_dir,
            storage_root,
            credential,
            index_dir,
            watch,
            pipeline,
            retry,
            supervisor,
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn watch(&self) -> &WatchSettings {
        &self.watch
    }

    pub fn pipeline(&self) -> &PipelineSettings {
        &self.pipeline
    }

    pub fn retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn supervisor(&self) -> &SupervisorSettings {
        &self.supervisor
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Settings loaded (profile: {}):", self.profile_label());
        tracing::info!("  api:        base={}, timeout={:?}", self.api_base, self.retry.request_timeout);
        tracing::info!("  watch:      dir={}, mode={}, quiescence={:?}", self.watch_dir.display(), self.watch.mode, self.watch.quiescence);
        tracing::info!("  storage:    root={}, index={}", self.storage_root.display(), self.index_dir.display());
        tracing::info!("  pipeline:   concurrency={}, queue={}, disposition={}", self.pipeline.concurrency, self.pipeline.queue_capacity, self.pipeline.disposition);
        tracing::info!("  retry:      max_attempts={}, backoff={:?}..{:?}", self.retry.max_attempts, self.retry.initial_backoff, self.retry.max_backoff);
        tracing::info!("  supervisor: grace={:?}, max_restarts={}", self.supervisor.shutdown_grace, self.supervisor.max_restarts);
    }

    /// Return a redacted view safe for status output (no credential).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "api_base": self.api_base.as_str(),
            "watch_dir": self.watch_dir,
            "storage_root": self.storage_root,
            "index_dir": self.index_dir,
            "watch": {
                "mode": self.watch.mode,
                "quiescence_ms": self.watch.quiescence.as_millis() as u64,
                "poll_interval_ms": self.watch.poll_interval.as_millis() as u64,
                "ignore_suffixes": self.watch.ignore_suffixes,
            },
            "pipeline": {
                "concurrency": self.pipeline.concurrency,
                "queue_capacity": self.pipeline.queue_capacity,
                "disposition": self.pipeline.disposition,
                "report_events": self.pipeline.report_events,
            },
            "retry": {
                "max_attempts": self.retry.max_attempts,
                "initial_backoff_ms": self.retry.initial_backoff.as_millis() as u64,
                "max_backoff_ms": self.retry.max_backoff.as_millis() as u64,
            },
            "credential_configured": !self.credential.expose().is_empty(),
        })
    }
}

fn parse_api_base(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl(format!(
            "{raw}: unsupported scheme '{other}'"
        ))),
    }
}

fn resolve_watch_dir(path: &Path) -> Result<PathBuf, ConfigError> {
    let err = |reason: String| ConfigError::WatchDir {
        path: path.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| err(e.to_string()))?;
    if !meta.is_dir() {
        return Err(err("not a directory".to_string()));
    }
    std::fs::read_dir(path).map_err(|e| err(e.to_string()))?;
    path.canonicalize().map_err(|e| err(e.to_string()))
}

fn resolve_storage_root(path: &Path) -> Result<PathBuf, ConfigError> {
    let err = |reason: String| ConfigError::StorageRoot {
        path: path.to_path_buf(),
        reason,
    };
    std::fs::create_dir_all(path).map_err(|e| err(e.to_string()))?;
    let meta = std::fs::metadata(path).map_err(|e| err(e.to_string()))?;
    if !meta.is_dir() {
        return Err(err("not a directory".to_string()));
    }
    path.canonicalize().map_err(|e| err(e.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
