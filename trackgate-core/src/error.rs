//! Error types for trackgate-core
//!
//! Every error is classified when it is created: recoverable errors are
//! eligible for retry, non-recoverable ones reset state instead.

use thiserror::Error;

/// Main error type for the trackgate-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure while handing a call to the collector
    #[error("network error: {0}")]
    Network(String),

    /// An operation did not complete in time
    #[error("timeout: {0}")]
    Timeout(String),

    /// The collector rejected or failed to process a call
    #[error("collector error: {0}")]
    Collector(String),

    /// The collector loader script failed to load
    #[error("script load failed: {0}")]
    ScriptLoad(String),

    /// A cookie could not be deleted
    #[error("cookie deletion failed: {0}")]
    CookieDeletion(String),

    /// The consent-mode command could not be delivered
    #[error("consent update failed: {0}")]
    ConsentUpdate(String),

    /// Measurement identifier does not match a known format
    #[error("invalid measurement id: {0}")]
    InvalidMeasurementId(String),

    /// Event name is empty after sanitization
    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),

    /// The host cannot store cookies
    #[error("cookies are not supported by this host")]
    CookiesUnsupported,

    /// No dispatch handle is installed
    #[error("collector dispatch handle unavailable")]
    Unavailable,

    /// Analytics consent was withdrawn before the call went out
    #[error("analytics consent withdrawn")]
    ConsentWithdrawn,

    /// Durable storage error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No async runtime to schedule background work on
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Whether the failed operation may be attempted again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Network(_)
            | Error::Timeout(_)
            | Error::Collector(_)
            | Error::ScriptLoad(_)
            | Error::CookieDeletion(_)
            | Error::ConsentUpdate(_)
            | Error::Unavailable
            | Error::Storage(_)
            | Error::Io(_) => true,
            Error::InvalidMeasurementId(_)
            | Error::InvalidEventName(_)
            | Error::CookiesUnsupported
            | Error::ConsentWithdrawn
            | Error::Json(_)
            | Error::Config(_)
            | Error::Runtime(_) => false,
        }
    }
}

/// Result type alias for trackgate-core
pub type Result<T> = std::result::Result<T, Error>;
