//! Sliding-window rate limiter over all events
//!
//! At most `max_events` events are accepted within any `window_ms` span.
//! Checking and recording are separate so preflight only consumes a slot
//! when the event is accepted by every later check too.

use super::window::SlidingWindow;
use crate::config::RateLimitConfig;
use crate::logging::Log;

/// Emergency cap on the timestamp buffer
pub const EMERGENCY_CAP: usize = 200;

/// Limit applied by a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_events: usize,
    pub window_ms: u64,
}

impl From<RateLimitConfig> for RateLimit {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            max_events: config.max_events,
            window_ms: config.window_ms,
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimitConfig::default().into()
    }
}

pub struct RateLimiter {
    limit: RateLimit,
    window: SlidingWindow<u64>,
    log: Log,
}

impl RateLimiter {
    pub fn new(limit: RateLimit, log: Log) -> Self {
        // Keep the configured maximum reachable even above the default cap.
        let hard_cap = EMERGENCY_CAP.max(limit.max_events.saturating_mul(2));
        Self {
            limit,
            window: SlidingWindow::new(hard_cap),
            log,
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Whether an event at `now` fits under the configured limit.
    ///
    /// Expires stale entries but records nothing.
    pub fn has_capacity(&mut self, now: u64) -> bool {
        self.has_capacity_with(now, self.limit)
    }

    /// Same as [`has_capacity`](Self::has_capacity) with a call-site limit.
    pub fn has_capacity_with(&mut self, now: u64, limit: RateLimit) -> bool {
        self.window.expire_before(now.saturating_sub(limit.window_ms));
        self.window.active_len() < limit.max_events
    }

    /// Consume one slot at `now`.
    pub fn record(&mut self, now: u64) {
        if let Some(dropped) = self.window.push(now) {
            self.log.emit(
                crate::logging::LogLevel::Warn,
                "rate_limit",
                "rate limit window hit emergency cap, discarded oldest entries",
                vec![("dropped", dropped.to_string())],
            );
        }
    }

    /// Check and, when accepted, consume a slot in one step.
    pub fn check_rate_limit(&mut self, now: u64) -> bool {
        if !self.has_capacity(now) {
            return false;
        }
        self.record(now);
        true
    }

    /// Number of events currently counted against the limit
    pub fn active_count(&self) -> usize {
        self.window.active_len()
    }

    /// Opportunistic trim, used when the page becomes hidden
    pub fn prune(&mut self, now: u64) {
        self.window.prune(now.saturating_sub(self.limit.window_ms));
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    #[cfg(test)]
    fn raw_len(&self) -> usize {
        self.window.raw_len()
    }
}
