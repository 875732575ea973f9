//! Client for the remote ingestion API.
//!
//! This crate provides:
//! - `IngestApi` trait for the remote collaborator (real client or test fakes)
//! - `ApiClient`, the authenticated reqwest implementation
//! - `RetryPolicy` and `Deliverer` for bounded exponential-backoff delivery
//! - `EventReporter` for best-effort stage events

pub mod client;
pub mod events;
pub mod retry;
pub mod traits;

pub use client::ApiClient;
pub use events::EventReporter;
pub use retry::{AttemptEvent, Delivered, Deliverer, DeliveryError, RetryPolicy};
pub use traits::{Ack, ApiError, EventStage, IngestApi, IngestEvent, IngestionNotice, NoticeMetadata};
