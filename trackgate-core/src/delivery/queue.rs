//! Bounded FIFO of events that could not be delivered
//!
//! Entries are resent on a timer and after every successful dispatch. Each
//! failed resend bumps the entry's retry count; at the limit the entry is
//! dropped. A full queue evicts its oldest entry. Both losses are logged.
//!
//! With persistence on, every mutation mirrors the whole queue into the
//! key-value store as one JSON array under [`QUEUE_STORAGE_KEY`].

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::logging::{Log, LogLevel};
use crate::storage::KeyValueStore;
use crate::types::{QueuedEvent, TrackedEvent};

/// Storage key of the durable queue copy
pub const QUEUE_STORAGE_KEY: &str = "trackgate.offline_queue";

const COMPONENT: &str = "queue";

/// Result of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sent: usize,
    /// Failed but kept for another pass
    pub retained: usize,
    /// Removed after a non-recoverable error or too many retries
    pub dropped: usize,
}

pub struct OfflineQueue {
    entries: VecDeque<QueuedEvent>,
    max_size: usize,
    max_retries: u32,
    store: Option<Arc<dyn KeyValueStore>>,
    log: Log,
}

impl OfflineQueue {
    /// An in-memory queue. See [`OfflineQueue::enable_persistence`].
    pub fn new(config: &QueueConfig, log: Log) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: config.max_size.max(1),
            max_retries: config.max_retries,
            store: None,
            log,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueuedEvent> {
        self.entries.iter()
    }

    /// Append an event, evicting the oldest entry when full.
    ///
    /// Returns the evicted entry, if any.
    pub fn enqueue(&mut self, event: TrackedEvent, now: u64) -> Option<QueuedEvent> {
        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            self.log.emit(
                LogLevel::Warn,
                COMPONENT,
                "offline queue full, evicting oldest event",
                vec![
                    ("event", old.event.name.clone()),
                    ("max_size", self.max_size.to_string()),
                ],
            );
        }

        self.entries.push_back(QueuedEvent::new(event, now));
        self.persist();
        evicted
    }

    /// Try to resend every entry, oldest first.
    pub fn flush<F>(&mut self, mut send: F) -> FlushOutcome
    where
        F: FnMut(&TrackedEvent) -> Result<()>,
    {
        let mut outcome = FlushOutcome::default();
        if self.entries.is_empty() {
            return outcome;
        }

        let pending = std::mem::take(&mut self.entries);
        for mut entry in pending {
            match send(&entry.event) {
                Ok(()) => outcome.sent += 1,
                Err(e) if !e.is_recoverable() => {
                    outcome.dropped += 1;
                    self.log.emit(
                        LogLevel::Warn,
                        COMPONENT,
                        "dropping queued event after non-recoverable error",
                        vec![("event", entry.event.name.clone()), ("error", e.to_string())],
                    );
                }
                Err(e) => {
                    entry.retry_count += 1;
                    if entry.retry_count >= self.max_retries {
                        outcome.dropped += 1;
                        self.log.emit(
                            LogLevel::Warn,
                            COMPONENT,
                            "dropping queued event after max retries",
                            vec![
                                ("event", entry.event.name.clone()),
                                ("retries", entry.retry_count.to_string()),
                                ("error", e.to_string()),
                            ],
                        );
                    } else {
                        outcome.retained += 1;
                        self.entries.push_back(entry);
                    }
                }
            }
        }

        if outcome.sent > 0 || outcome.dropped > 0 {
            self.log.emit(
                LogLevel::Debug,
                COMPONENT,
                "offline queue flushed",
                vec![
                    ("sent", outcome.sent.to_string()),
                    ("retained", outcome.retained.to_string()),
                    ("dropped", outcome.dropped.to_string()),
                ],
            );
        }
        self.persist();
        outcome
    }

    /// Drop every entry, including the durable copy.
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(QUEUE_STORAGE_KEY) {
                self.log_storage_error("clear", &e);
            }
        }
    }

    /// Mirror the queue into `store`, merging in whatever it already holds.
    ///
    /// Rehydrated entries go ahead of anything queued in memory. Malformed
    /// records are skipped.
    pub fn enable_persistence(&mut self, store: Arc<dyn KeyValueStore>) {
        let restored = read_persisted(store.as_ref(), &self.log);
        if !restored.is_empty() {
            self.log.emit(
                LogLevel::Info,
                COMPONENT,
                "restored offline queue",
                vec![("entries", restored.len().to_string())],
            );
        }

        let mut merged: VecDeque<QueuedEvent> = restored.into();
        merged.append(&mut self.entries);
        while merged.len() > self.max_size {
            merged.pop_front();
        }
        self.entries = merged;
        self.store = Some(store);
        self.persist();
    }

    /// Stop mirroring and remove the durable copy.
    pub fn disable_persistence(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.remove(QUEUE_STORAGE_KEY) {
                self.log_storage_error("remove", &e);
            }
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let result = if self.entries.is_empty() {
            store.remove(QUEUE_STORAGE_KEY)
        } else {
            let records: Vec<&QueuedEvent> = self.entries.iter().collect();
            serde_json::to_string(&records)
                .map_err(Into::into)
                .and_then(|json| store.set(QUEUE_STORAGE_KEY, &json))
        };
        if let Err(e) = result {
            self.log_storage_error("write", &e);
        }
    }

    fn log_storage_error(&self, op: &str, error: &crate::error::Error) {
        self.log.emit(
            LogLevel::Warn,
            COMPONENT,
            format!("offline queue storage {} failed", op),
            vec![("error", error.to_string())],
        );
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.entries.len())
            .field("max_size", &self.max_size)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

/// Load the durable queue copy, skipping anything that does not parse.
pub fn read_persisted(store: &dyn KeyValueStore, log: &Log) -> Vec<QueuedEvent> {
    let raw = match store.get(QUEUE_STORAGE_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            log.emit(
                LogLevel::Warn,
                COMPONENT,
                "could not read offline queue",
                vec![("error", e.to_string())],
            );
            return Vec::new();
        }
    };

    let records: Vec<Value> = match serde_json::from_str(&raw) {
        Ok(Value::Array(records)) => records,
        Ok(_) | Err(_) => {
            log.warn(COMPONENT, "stored offline queue is not a JSON array, ignoring it");
            return Vec::new();
        }
    };

    let total = records.len();
    let entries: Vec<QueuedEvent> = records
        .into_iter()
        .filter_map(|record| serde_json::from_value::<QueuedEvent>(record).ok())
        .filter(|entry| !entry.event.name.is_empty())
        .collect();

    if entries.len() < total {
        log.emit(
            LogLevel::Warn,
            COMPONENT,
            "skipped malformed offline queue records",
            vec![("skipped", (total - entries.len()).to_string())],
        );
    }
    entries
}
