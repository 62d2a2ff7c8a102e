//! Counters describing what the tracker did with each event

use std::collections::HashMap;

use crate::types::RejectReason;

/// Tracking statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingStats {
    /// Events that passed preflight
    pub accepted: usize,
    /// Rejections by reason, including those at batch flush
    pub rejected: HashMap<RejectReason, usize>,
    /// Events handed to the collector successfully
    pub dispatched: usize,
    /// Events whose dispatch finally failed
    pub dispatch_failures: usize,
    /// Events moved into the offline queue
    pub queued: usize,
    /// Queue entries evicted to make room
    pub evicted: usize,
    /// Events given up on for good
    pub dropped: usize,
    /// Queue entries resent successfully
    pub flushed_from_queue: usize,
    /// Batch flushes performed
    pub batches_flushed: usize,
}

impl TrackingStats {
    pub fn record_rejection(&mut self, reason: RejectReason) {
        *self.rejected.entry(reason).or_default() += 1;
    }

    pub fn rejected_for(&self, reason: RejectReason) -> usize {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}
