//! Getting accepted events to the collector
//!
//! - [`batch`]: optional buffering of accepted events
//! - [`retry`]: exponential backoff around a single dispatch
//! - [`queue`]: the bounded offline queue for undeliverable events

pub mod batch;
pub mod queue;
pub mod retry;

pub use batch::{BatchBuffer, PushOutcome};
pub use queue::{read_persisted, FlushOutcome, OfflineQueue, QUEUE_STORAGE_KEY};
pub use retry::{retry_with_backoff, RetryPolicy};
