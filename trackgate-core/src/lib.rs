//! # trackgate-core
//!
//! Core library for trackgate - a consent-aware client-side analytics
//! event pipeline.
//!
//! This library provides:
//! - Preflight checks for every event (consent, sampling, rate limit, dedup)
//! - Lifecycle management for the third-party collector script
//! - Batching, retry with backoff, and a bounded offline queue
//! - Cookie cleanup when consent is withdrawn
//! - Configuration, durable storage, and logging infrastructure
//!
//! ## Architecture
//!
//! An event flows through three stages:
//! - **Preflight:** accept or reject, with a [`RejectReason`]
//! - **Delivery:** optional batch buffer, then dispatch with retries
//! - **Queue:** undeliverable events wait offline and are resent later
//!
//! Everything the pipeline touches on the page comes through a
//! [`RuntimeContext`], so it runs the same against a real host or the
//! in-memory one in [`host::memory`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackgate_core::{Config, ConsentState, SharedConsent, Tracker};
//!
//! # async fn example() -> trackgate_core::Result<()> {
//! let consent = SharedConsent::with_state(ConsentState::granted());
//! let tracker = Tracker::builder(Config::load()?)
//!     .consent(Arc::new(consent))
//!     .build()?;
//!
//! tracker.init_tracking();
//! tracker.track_page_view("/");
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{CollectorCall, CollectorLifecycle, LoadState};
pub use config::Config;
pub use consent::{ConsentModeSync, ConsentStore, SharedConsent};
pub use error::{Error, Result};
pub use host::{HostBindings, Location, RuntimeContext};
pub use logging::{Log, LogLevel, Logger};
pub use pipeline::{Decision, Preflight};
pub use stats::TrackingStats;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use tracker::{Pending, Tracker, TrackerBuilder};
pub use types::*;

// Public modules
pub mod clock;
pub mod collector;
pub mod config;
pub mod consent;
pub mod delivery;
pub mod error;
pub mod host;
pub mod logging;
pub mod pipeline;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod types;
