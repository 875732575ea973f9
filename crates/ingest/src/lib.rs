//! Export intake: from a stable file in the watch directory to a stored,
//! acknowledged ingestion.
//!
//! - `storage`: content-addressed copies under the storage root
//! - `disposition`: what happens to the source afterwards
//! - `pipeline`: hash → claim → store → notify → dispose, per candidate
//! - `worker`: the supervised process tying watcher and pipeline together

pub mod disposition;
pub mod error;
pub mod mime;
pub mod pipeline;
pub mod storage;
pub mod worker;

pub use disposition::{Disposed, Disposer};
pub use error::PipelineError;
pub use pipeline::{IngestPipeline, IoRetry, Outcome, PipelineCounters};
pub use storage::{ContentStore, StoreError, Stored};
pub use worker::{IntakeWorker, RunMode};
