//! ingest-worker — watches the export directory and ingests stable files.
//!
//! Each file is hashed, copied into `STORAGE_ROOT/{identity}/`, and
//! announced to `POST {API_BASE}/ingestions`. The identity index under the
//! storage root makes restarts and re-exports idempotent.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use intake_api::{ApiClient, ApiError, IngestApi};
use intake_core::config::{load_dotenv, load_dotenv_from};
use intake_core::Settings;
use intake_index::IngestionIndex;
use intake_ingest::{IngestPipeline, IntakeWorker, RunMode};
use intake_supervisor::{SupervisorBuilder, Worker};

// ── CLI ─────────────────────────────────────────────────────────────

/// Export intake worker — stores exports by content hash and notifies the API.
#[derive(Parser, Debug)]
#[command(name = "ingest-worker", version, about)]
struct Cli {
    /// Load settings from this dotenv file instead of `./.env`.
    #[arg(long, env = "INTAKE_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Ingest what is in the watch directory now, then exit.
    #[arg(long)]
    once: bool,

    /// Print the redacted settings and index statistics, then exit.
    #[arg(long, conflicts_with = "once")]
    status: bool,

    /// Make permanently failed identities eligible again before starting.
    #[arg(long)]
    retry_failed: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => load_dotenv_from(path)?,
        None => load_dotenv(),
    }
    let settings = Arc::new(Settings::from_env().context("invalid configuration")?);
    settings.log_summary();

    let index = Arc::new(
        IngestionIndex::open(settings.index_dir())
            .with_context(|| format!("cannot open identity index at {}", settings.index_dir().display()))?,
    );

    if cli.status {
        let status = serde_json::json!({
            "settings": settings.redacted_summary(),
            "index": index.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if cli.retry_failed {
        let reset = index.reset_failed()?;
        info!(reset, "failed identities reset for retry");
    }

    let client = ApiClient::from_settings(&settings).context("cannot build API client")?;
    match client.health().await {
        Ok(()) => info!(endpoint = client.endpoint(), "ingestion API reachable"),
        Err(e @ ApiError::Auth { .. }) => {
            error!(error = %e, "ingestion API rejected WORKER_JWT");
            return Err(e).context("credential rejected by the ingestion API");
        }
        Err(e) => warn!(error = %e, "ingestion API health check failed, continuing"),
    }
    let api: Arc<dyn IngestApi> = Arc::new(client);

    let pipeline = Arc::new(IngestPipeline::from_settings(&settings, Arc::clone(&index), api));
    let mode = if cli.once { RunMode::Once } else { RunMode::Continuous };
    let worker = Arc::new(IntakeWorker::new(Arc::clone(&settings), pipeline, mode));

    let supervisor = SupervisorBuilder::from_settings(worker.name(), settings.supervisor()).build();
    let result = supervisor.run(worker).await;

    let stats = index.stats();
    info!(
        total = stats.total,
        acknowledged = stats.acknowledged,
        failed = stats.failed,
        unfinished = stats.pending + stats.stored,
        "ingest worker exiting"
    );

    if let Err(e) = result {
        error!(error = %e, kind = %e.kind(), "ingest worker stopped");
        return Err(e.into());
    }
    Ok(())
}
