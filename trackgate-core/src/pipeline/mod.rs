//! Preflight: the accept/reject decision every event goes through
//!
//! Checks run cheapest first and stop at the first failure:
//!
//! 1. host available, else `unavailable`
//! 2. sampling draw, else `sampled_out`
//! 3. analytics consent, else `no_consent`
//! 4. collector loaded, else `not_loaded`
//! 5. name sanitization, else `invalid_name`
//! 6. rate limit, else `rate_limited`
//! 7. duplicate window, else `duplicate`
//! 8. payload sanitization (never rejects)
//!
//! Only a fully accepted event consumes a rate-limit slot and a dedup
//! entry. Consent is read from the store on every evaluation.

pub mod dedup;
pub mod rate_limit;
pub mod sampler;
pub mod sanitize;
mod window;

pub use dedup::{hash_payload, Deduplicator};
pub use rate_limit::{RateLimit, RateLimiter};
pub use sampler::{FixedRandom, RandomSource, Sampler, ThreadRandom};
pub use sanitize::{sanitize_event_name, sanitize_payload};

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::Config;
use crate::consent::ConsentStore;
use crate::logging::Log;
use crate::types::{ConsentCategory, RejectReason, TrackedEvent};

/// Collector state preflight is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    /// A host page exists to dispatch into
    pub available: bool,
    /// The collector finished loading
    pub loaded: bool,
}

impl Gate {
    pub fn open() -> Self {
        Self {
            available: true,
            loaded: true,
        }
    }
}

/// Checks to skip for one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Skip {
    pub sampling: bool,
    pub rate_limit: bool,
    pub dedup: bool,
}

impl Skip {
    /// Re-evaluation of an event that was already accepted once, as when a
    /// batch is flushed. Its bookkeeping is not repeated.
    pub fn reevaluation() -> Self {
        Self {
            sampling: true,
            rate_limit: true,
            dedup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept(TrackedEvent),
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accept(_))
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Decision::Accept(_) => None,
            Decision::Reject(reason) => Some(*reason),
        }
    }
}

pub struct Preflight {
    sampler: Sampler,
    rate_limiter: RateLimiter,
    dedup: Deduplicator,
    consent: Arc<dyn ConsentStore>,
    random: Arc<dyn RandomSource>,
}

impl Preflight {
    pub fn new(
        config: &Config,
        consent: Arc<dyn ConsentStore>,
        random: Arc<dyn RandomSource>,
        log: Log,
    ) -> Self {
        Self {
            sampler: Sampler::new(&config.sampling.rates, &log),
            rate_limiter: RateLimiter::new(config.rate_limit.into(), log.clone()),
            dedup: Deduplicator::new(config.dedup.window_ms, log),
            consent,
            random,
        }
    }

    pub fn evaluate(
        &mut self,
        name: &str,
        payload: Option<&Map<String, Value>>,
        gate: Gate,
        now: u64,
        skip: Skip,
    ) -> Decision {
        if !gate.available {
            return Decision::Reject(RejectReason::Unavailable);
        }

        if !skip.sampling && !self.sampler.should_sample(name, self.random.as_ref()) {
            return Decision::Reject(RejectReason::SampledOut);
        }

        if !self.consent.has_consent(ConsentCategory::Analytics) {
            return Decision::Reject(RejectReason::NoConsent);
        }

        if !gate.loaded {
            return Decision::Reject(RejectReason::NotLoaded);
        }

        let Some(clean_name) = sanitize_event_name(name) else {
            return Decision::Reject(RejectReason::InvalidName);
        };

        if !skip.rate_limit && !self.rate_limiter.has_capacity(now) {
            return Decision::Reject(RejectReason::RateLimited);
        }

        let payload_hash = hash_payload(payload);
        if !skip.dedup && self.dedup.is_duplicate(&clean_name, &payload_hash, now) {
            return Decision::Reject(RejectReason::Duplicate);
        }

        let clean_payload = payload
            .map(sanitize_payload)
            .filter(|p| !p.is_empty());

        if !skip.rate_limit {
            self.rate_limiter.record(now);
        }
        if !skip.dedup {
            self.dedup.record(&clean_name, &payload_hash, now);
        }

        Decision::Accept(TrackedEvent::new(clean_name, clean_payload))
    }

    /// Trim expired window entries without resetting them.
    pub fn prune(&mut self, now: u64) {
        self.rate_limiter.prune(now);
        self.dedup.prune(now);
    }

    /// Forget every rate-limit and dedup entry.
    pub fn reset(&mut self) {
        self.rate_limiter.reset();
        self.dedup.reset();
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }
}
