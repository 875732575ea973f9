//! Content-addressed artifact store.
//!
//! ```text
//! STORAGE_ROOT/
//!   3f2a…c1/
//!     claim_001.csv          <- verified copy, named after the original
//!     .claim_001.csv.tmp     <- copy in progress
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use intake_core::{ErrorKind, Identity};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source {} disappeared", path.display())]
    SourceGone { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The source changed between hashing and copying.
    #[error("copy of {} does not match {expected}: got {actual} ({actual_size} bytes, expected {expected_size})", path.display())]
    Mismatch {
        path: PathBuf,
        expected: Identity,
        actual: Identity,
        expected_size: u64,
        actual_size: u64,
    },

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Task(_) => ErrorKind::TransientIo,
            Self::SourceGone { .. } | Self::Mismatch { .. } => ErrorKind::PermanentValidation,
        }
    }

    /// Worth another try after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Task(_))
    }
}

/// Where an artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub path: PathBuf,
    /// An identical copy was already present and nothing was written.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every artifact of one identity.
    pub fn dir_for(&self, identity: &Identity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    /// Copy `source` to `{root}/{identity}/{sanitised name}`.
    ///
    /// The copy goes through a dot-prefixed temp file in the target
    /// directory, is flushed, re-hashed and only then renamed into place.
    /// If the directory already holds a file with the right size and hash
    /// it is returned untouched.
    pub async fn store(
        &self,
        source: &Path,
        identity: &Identity,
        original_name: &str,
        expected_size: u64,
    ) -> Result<Stored, StoreError> {
        let dir = self.dir_for(identity);
        let source = source.to_path_buf();
        let identity = identity.clone();
        let name = sanitise_name(original_name);

        tokio::task::spawn_blocking(move || store_blocking(&dir, &source, &identity, &name, expected_size))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Whether `path` holds exactly `expected_size` bytes hashing to `identity`.
    pub async fn verify(
        &self,
        path: &Path,
        identity: &Identity,
        expected_size: u64,
    ) -> Result<bool, StoreError> {
        let path = path.to_path_buf();
        let identity = identity.clone();
        tokio::task::spawn_blocking(move || matches_identity(&path, &identity, expected_size))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn store_blocking(
    dir: &Path,
    source: &Path,
    identity: &Identity,
    name: &str,
    expected_size: u64,
) -> Result<Stored, StoreError> {
    fs::create_dir_all(dir).map_err(io_at(dir))?;
    let target = dir.join(name);

    if let Some(existing) = find_existing(dir, &target, identity, expected_size)? {
        debug!(identity = %identity.short(), path = %existing.display(), "artifact already stored");
        return Ok(Stored {
            path: existing,
            reused: true,
        });
    }

    let tmp = dir.join(format!(".{name}.tmp"));
    match fs::copy(source, &tmp) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound && !source.exists() => {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::SourceGone {
                path: source.to_path_buf(),
            });
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Io {
                path: source.to_path_buf(),
                source: e,
            });
        }
    }

    File::open(&tmp)
        .and_then(|f| f.sync_all())
        .map_err(io_at(&tmp))?;

    let (actual, actual_size) = Identity::of_file(&tmp).map_err(io_at(&tmp))?;
    if actual != *identity || actual_size != expected_size {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Mismatch {
            path: source.to_path_buf(),
            expected: identity.clone(),
            actual,
            expected_size,
            actual_size,
        });
    }

    fs::rename(&tmp, &target).map_err(io_at(&target))?;
    info!(identity = %identity.short(), path = %target.display(), size = actual_size, "artifact stored");

    Ok(Stored {
        path: target,
        reused: false,
    })
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// A verified copy already in `dir`, preferring `target`.
fn find_existing(
    dir: &Path,
    target: &Path,
    identity: &Identity,
    expected_size: u64,
) -> Result<Option<PathBuf>, StoreError> {
    if target.is_file() {
        if matches_identity(target, identity, expected_size)? {
            return Ok(Some(target.to_path_buf()));
        }
        warn!(path = %target.display(), "stored copy does not match its identity, rewriting");
    }

    let entries = fs::read_dir(dir).map_err(io_at(dir))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || path == target || !path.is_file() {
            continue;
        }
        if matches_identity(&path, identity, expected_size)? {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn matches_identity(path: &Path, identity: &Identity, expected_size: u64) -> Result<bool, StoreError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() != expected_size => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    let (actual, _) = Identity::of_file(path).map_err(io_at(path))?;
    Ok(actual == *identity)
}

/// Make an export file name safe to use inside the storage root.
///
/// Runs of characters outside `[A-Za-z0-9_.-]` collapse to one `_`, and
/// leading dots are dropped so the result is never hidden or a parent
/// reference.
pub fn sanitise_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    let trimmed = out.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
