//! Append-only timestamp window shared by the rate limiter and deduplicator
//!
//! Entries are appended in time order. A `start` cursor marks the oldest
//! entry still inside the window, so expiring entries is a cursor bump
//! rather than a shift. The dead prefix is physically dropped once it
//! outgrows half the buffer, and the buffer is hard-capped: past `hard_cap`
//! entries the oldest half is discarded regardless of age.

/// Anything with a millisecond timestamp
pub(crate) trait Stamped {
    fn stamp(&self) -> u64;
}

impl Stamped for u64 {
    fn stamp(&self) -> u64 {
        *self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SlidingWindow<T> {
    entries: Vec<T>,
    start: usize,
    hard_cap: usize,
}

impl<T: Stamped> SlidingWindow<T> {
    pub(crate) fn new(hard_cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            start: 0,
            hard_cap: hard_cap.max(2),
        }
    }

    /// Move the cursor past every entry stamped before `cutoff`.
    ///
    /// Entries stamped exactly at `cutoff` stay active.
    pub(crate) fn expire_before(&mut self, cutoff: u64) {
        while self.start < self.entries.len() && self.entries[self.start].stamp() < cutoff {
            self.start += 1;
        }
        self.compact();
    }

    /// Entries still inside the window, oldest first
    pub(crate) fn active(&self) -> &[T] {
        &self.entries[self.start..]
    }

    pub(crate) fn active_len(&self) -> usize {
        self.entries.len() - self.start
    }

    /// Physical buffer length including the expired prefix
    pub(crate) fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// Append an entry. Returns how many entries the emergency cap
    /// discarded, if it fired.
    pub(crate) fn push(&mut self, entry: T) -> Option<usize> {
        self.entries.push(entry);
        if self.entries.len() > self.hard_cap {
            let dropped = self.entries.len() / 2;
            self.entries.drain(..dropped);
            self.start = self.start.saturating_sub(dropped);
            return Some(dropped);
        }
        None
    }

    /// Drop the expired prefix once it exceeds half the buffer.
    fn compact(&mut self) {
        if self.start > 0 && self.start * 2 > self.entries.len() {
            self.entries.drain(..self.start);
            self.start = 0;
        }
    }

    /// Expire old entries and drop the whole dead prefix now.
    pub(crate) fn prune(&mut self, cutoff: u64) {
        self.expire_before(cutoff);
        if self.start > 0 {
            self.entries.drain(..self.start);
            self.start = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.start = 0;
    }
}
