//! Persistent identity → record index.
//!
//! Survives restarts so the same content is never ingested twice, and
//! hands out exclusive claims so concurrent workers never race on one
//! identity.

pub mod store;

pub use store::{Claim, ClaimGuard, IndexError, IndexStats, IngestionIndex};
