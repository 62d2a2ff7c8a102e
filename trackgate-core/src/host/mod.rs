//! Capabilities of the hosting page
//!
//! The pipeline never reaches for ambient globals. Everything it touches on
//! the page is passed in through a [`RuntimeContext`]:
//!
//! - [`Document`]: script elements (inject, remove, enumerate)
//! - [`CookieJar`]: cookie enumeration and raw cookie writes
//! - [`DispatchHandle`]: the callable the collector script drains
//! - [`Location`]: hostname and path, for cookie scoping and page views
//!
//! A context without [`HostBindings`] is a no-op environment: nothing is
//! loaded and every event is rejected as unavailable.
//!
//! [`memory`] provides in-process implementations of every capability.

pub mod memory;

use std::sync::Arc;
use tokio::sync::oneshot;

use crate::collector::CollectorCall;
use crate::error::Result;

pub use memory::{DataLayer, MemoryCookieJar, MemoryDocument, ScriptBehavior};

// ============================================
// Document
// ============================================

pub type ScriptId = u64;

/// A script element currently in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    pub id: ScriptId,
    pub src: String,
}

/// How a script element finished loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    Loaded,
    Failed(String),
}

/// A freshly inserted script element
///
/// `outcome` resolves once the host reports load or error. If the element
/// is removed first the sender is dropped and the receiver errors.
#[derive(Debug)]
pub struct ScriptElement {
    pub id: ScriptId,
    pub outcome: oneshot::Receiver<ScriptOutcome>,
}

pub trait Document: Send + Sync {
    /// Insert an async script element pointing at `src`.
    fn append_script(&self, src: &str) -> Result<ScriptElement>;

    /// Remove a script element. Returns false if it was not present.
    fn remove_script(&self, id: ScriptId) -> bool;

    /// Every script element in the document, including foreign ones.
    fn scripts(&self) -> Vec<ScriptInfo>;
}

// ============================================
// Cookies
// ============================================

pub trait CookieJar: Send + Sync {
    /// Names of cookies visible from the current location.
    fn cookie_names(&self) -> Vec<String>;

    /// Apply a raw `name=value; attr=...` assignment.
    fn write(&self, assignment: &str) -> Result<()>;

    /// Whether cookies written here can be read back.
    fn probe_writable(&self) -> bool;
}

// ============================================
// Dispatch
// ============================================

/// The page-global callable the collector script consumes.
pub trait DispatchHandle: Send + Sync {
    fn dispatch(&self, call: CollectorCall) -> Result<()>;

    /// Drop buffered calls the collector has not consumed yet.
    fn clear_buffer(&self) {}
}

// ============================================
// Context
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub hostname: String,
    pub pathname: String,
}

impl Location {
    pub fn new(hostname: impl Into<String>, pathname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            pathname: pathname.into(),
        }
    }
}

/// Everything the pipeline may touch on a real page
#[derive(Clone)]
pub struct HostBindings {
    pub document: Arc<dyn Document>,
    pub cookies: Arc<dyn CookieJar>,
    pub dispatch: Arc<dyn DispatchHandle>,
    pub location: Location,
}

/// Environment the tracker runs in, fixed at construction
#[derive(Clone, Default)]
pub struct RuntimeContext {
    /// `None` outside a browser-like host
    pub host: Option<HostBindings>,
    /// Collector loading only happens in production
    pub production: bool,
    pub measurement_id: Option<String>,
}

impl RuntimeContext {
    /// A context with no page: tracking is a no-op.
    pub fn headless() -> Self {
        Self::default()
    }

    pub fn with_host(host: HostBindings) -> Self {
        Self {
            host: Some(host),
            production: false,
            measurement_id: None,
        }
    }

    pub fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn measurement_id(mut self, id: impl Into<String>) -> Self {
        self.measurement_id = Some(id.into());
        self
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("has_host", &self.host.is_some())
            .field("production", &self.production)
            .field("measurement_id", &self.measurement_id)
            .finish()
    }
}
