//! Consent state as seen by the pipeline
//!
//! The pipeline only ever reads consent. It asks the store on every check
//! and never caches the answer, so a revocation applies to the very next
//! event.

mod mode;

pub use mode::ConsentModeSync;

use std::sync::{Arc, RwLock};

use crate::types::{ConsentCategory, ConsentState};

/// Read-only view of the user's consent choices
pub trait ConsentStore: Send + Sync {
    /// `None` until the user has made a choice
    fn get_consent(&self) -> Option<ConsentState>;

    fn has_consent(&self, category: ConsentCategory) -> bool {
        self.get_consent()
            .map(|c| c.allows(category))
            .unwrap_or(false)
    }
}

/// A consent store backed by shared memory. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct SharedConsent {
    state: Arc<RwLock<Option<ConsentState>>>,
}

impl SharedConsent {
    /// Store with no recorded choice
    pub fn undecided() -> Self {
        Self::default()
    }

    pub fn with_state(state: ConsentState) -> Self {
        Self {
            state: Arc::new(RwLock::new(Some(state))),
        }
    }

    pub fn set(&self, state: ConsentState) {
        match self.state.write() {
            Ok(mut guard) => *guard = Some(state),
            Err(poisoned) => *poisoned.into_inner() = Some(state),
        }
    }

    pub fn clear(&self) {
        match self.state.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

impl ConsentStore for SharedConsent {
    fn get_consent(&self) -> Option<ConsentState> {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
