//! Integration with the third-party collector
//!
//! - [`call`]: typed commands for the page-global dispatch handle
//! - [`loader`]: measurement id validation and loader script URLs
//! - [`lifecycle`]: the `Unloaded → Loading → Loaded` state machine
//! - [`cookies`]: removal of the collector's cookies on unload
//!
//! Nothing here sends data over the network itself. The collector script,
//! once loaded, drains the dispatch handle's buffer on its own.

pub mod call;
pub mod cookies;
pub mod lifecycle;
pub mod loader;

pub use call::{CollectorCall, ConsentMode, ConsentParams, ConsentSignal};
pub use cookies::{CleanupReport, CleanupStrategy, CookieCleaner};
pub use lifecycle::{CollectorLifecycle, LoadState, UnloadReport};
pub use loader::{loader_src, matches_loader, validate_measurement_id};
