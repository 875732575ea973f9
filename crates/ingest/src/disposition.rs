//! What happens to a source file once its ingestion is settled.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use intake_core::{Identity, Settings, SourceDisposition};

/// What [`Disposer`] did with a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposed {
    Moved(PathBuf),
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Disposer {
    disposition: SourceDisposition,
    processed_dir: PathBuf,
    failed_dir: PathBuf,
}

impl Disposer {
    pub fn new(
        watch_dir: &Path,
        disposition: SourceDisposition,
        processed: &str,
        failed: &str,
    ) -> Self {
        Self {
            disposition,
            processed_dir: watch_dir.join(processed),
            failed_dir: watch_dir.join(failed),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let pipeline = settings.pipeline();
        Self::new(
            settings.watch_dir(),
            pipeline.disposition,
            &pipeline.processed_dir,
            &pipeline.failed_dir,
        )
    }

    pub fn disposition(&self) -> SourceDisposition {
        self.disposition
    }

    /// Called once the content is stored and acknowledged.
    pub async fn on_success(&self, source: &Path, identity: &Identity) -> io::Result<Option<Disposed>> {
        match self.disposition {
            SourceDisposition::Leave => Ok(None),
            SourceDisposition::Delete => remove(source).await,
            SourceDisposition::Archive => move_into(&self.processed_dir, source, identity).await,
        }
    }

    /// Called when the content gave up for good. Only archive mode touches it.
    pub async fn on_failure(&self, source: &Path, identity: &Identity) -> io::Result<Option<Disposed>> {
        match self.disposition {
            SourceDisposition::Archive => move_into(&self.failed_dir, source, identity).await,
            SourceDisposition::Leave | SourceDisposition::Delete => Ok(None),
        }
    }
}

async fn remove(source: &Path) -> io::Result<Option<Disposed>> {
    match tokio::fs::remove_file(source).await {
        Ok(()) => {
            info!(path = %source.display(), "source deleted");
            Ok(Some(Disposed::Deleted))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %source.display(), "source already gone");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn move_into(dir: &Path, source: &Path, identity: &Identity) -> io::Result<Option<Disposed>> {
    if !tokio::fs::try_exists(source).await? {
        debug!(path = %source.display(), "source already gone");
        return Ok(None);
    }
    tokio::fs::create_dir_all(dir).await?;

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mut target = dir.join(&name);
    if tokio::fs::try_exists(&target).await? {
        target = dir.join(tagged_name(&name, identity));
    }

    tokio::fs::rename(source, &target).await?;
    info!(from = %source.display(), to = %target.display(), "source moved");
    Ok(Some(Disposed::Moved(target)))
}

/// `claim.csv` → `claim.3f2ac1d09e7b.csv`
fn tagged_name(name: &str, identity: &Identity) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem}.{}.{}", identity.short(), ext.to_string_lossy()),
        None => format!("{stem}.{}", identity.short()),
    }
}
