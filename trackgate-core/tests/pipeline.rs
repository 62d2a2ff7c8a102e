//! End-to-end tests for the tracking pipeline
//!
//! Each test wires a [`Tracker`] to the in-memory host and drives it the
//! way a page would: consent, `init_tracking`, then events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use trackgate_core::collector::cookies::is_collector_cookie;
use trackgate_core::collector::{matches_loader, CollectorCall, ConsentMode, ConsentSignal};
use trackgate_core::config::Config;
use trackgate_core::delivery::QUEUE_STORAGE_KEY;
use trackgate_core::host::{
    DataLayer, DispatchHandle, Document, HostBindings, Location, MemoryCookieJar, MemoryDocument,
};
use trackgate_core::pipeline::{hash_payload, FixedRandom};
use trackgate_core::storage::{KeyValueStore, MemoryStore};
use trackgate_core::{
    ConsentState, Error, LoadState, ManualClock, QueuedEvent, RejectReason, Result,
    RuntimeContext, SharedConsent, Tracker,
};

const ID: &str = "G-TEST123";

struct Page {
    document: Arc<MemoryDocument>,
    cookies: Arc<MemoryCookieJar>,
    clock: ManualClock,
    consent: SharedConsent,
}

impl Page {
    fn new(consent: ConsentState) -> Self {
        Self {
            document: Arc::new(MemoryDocument::default()),
            cookies: Arc::new(MemoryCookieJar::new("www.example.com", "/")),
            clock: ManualClock::new(1_700_000_000_000),
            consent: SharedConsent::with_state(consent),
        }
    }

    fn tracker(&self, config: Config, dispatch: Arc<dyn DispatchHandle>) -> Tracker {
        self.tracker_with_store(config, dispatch, None)
    }

    fn tracker_with_store(
        &self,
        config: Config,
        dispatch: Arc<dyn DispatchHandle>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Tracker {
        let host = HostBindings {
            document: self.document.clone(),
            cookies: self.cookies.clone(),
            dispatch,
            location: Location::new("www.example.com", "/"),
        };
        let mut builder = Tracker::builder(config)
            .context(RuntimeContext::with_host(host).production(true).measurement_id(ID))
            .consent(Arc::new(self.consent.clone()))
            .clock(Arc::new(self.clock.clone()))
            .random(Arc::new(FixedRandom(0.0)));
        if let Some(store) = store {
            builder = builder.store(store);
        }
        builder.build().unwrap()
    }
}

fn event_names(calls: &[CollectorCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            CollectorCall::Event { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Records every event call and fails them while `failing` is set.
#[derive(Default)]
struct RecordingHandle {
    layer: DataLayer,
    failing: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
}

impl RecordingHandle {
    fn failing() -> Arc<Self> {
        let handle = Arc::new(Self::default());
        handle.failing.store(true, Ordering::SeqCst);
        handle
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl DispatchHandle for RecordingHandle {
    fn dispatch(&self, call: CollectorCall) -> Result<()> {
        if matches!(call, CollectorCall::Event { .. }) {
            self.attempts.lock().unwrap().push(Instant::now());
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Network("connection refused".to_string()));
            }
        }
        self.layer.dispatch(call)
    }

    fn clear_buffer(&self) {
        self.layer.clear_buffer();
    }
}

// ============================================
// Preflight
// ============================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_within_window_accepted_once() {
    let page = Page::new(ConsentState::granted());
    let layer = Arc::new(DataLayer::new());
    let tracker = page.tracker(Config::default(), layer.clone());
    tracker.init_tracking();

    assert!(tracker.track("x", Some(&json!({"a": 1}))).is_accepted());
    assert_eq!(
        tracker.track("x", Some(&json!({"a": 1}))).reason(),
        Some(RejectReason::Duplicate)
    );

    page.clock.advance(1_000);
    assert!(tracker.track("x", Some(&json!({"a": 1}))).is_accepted());
    assert_eq!(event_names(&layer.calls()), vec!["x", "x"]);
}

#[tokio::test(start_paused = true)]
async fn test_no_consent_means_no_dispatch() {
    let page = Page::new(ConsentState::denied());
    let layer = Arc::new(DataLayer::new());
    let tracker = page.tracker(Config::default(), layer.clone());
    tracker.init_tracking();

    for i in 0..50 {
        let decision = tracker.track(&format!("event_{}", i), Some(&json!({"i": i})));
        assert_eq!(decision.reason(), Some(RejectReason::NoConsent));
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(layer.is_empty());
    assert!(page.document.scripts().is_empty());
    assert_eq!(tracker.stats().rejected_for(RejectReason::NoConsent), 50);
    assert_eq!(tracker.stats().dispatched, 0);
}

#[test]
fn test_payload_hash_ignores_key_order() {
    let a = json!({"a": 1, "b": 2});
    let b = json!({"b": 2, "a": 1});
    let c = json!({"a": 1, "b": 3});

    assert_eq!(
        hash_payload(a.as_object()),
        hash_payload(b.as_object())
    );
    assert_ne!(
        hash_payload(a.as_object()),
        hash_payload(c.as_object())
    );
}

// ============================================
// Collector lifecycle
// ============================================

#[tokio::test(start_paused = true)]
async fn test_withdrawing_consent_removes_every_trace() {
    let page = Page::new(ConsentState::granted());
    page.cookies.seed("_ga", "GA1.1.123", Some(".example.com"), "/");
    page.cookies.seed("_ga_TEST123", "GS1.1.1", Some(".example.com"), "/");
    page.cookies.seed("_gid", "GA1.1.456", None, "/");
    page.cookies.seed("session", "keep-me", None, "/");

    let layer = Arc::new(DataLayer::new());
    let tracker = page.tracker(Config::default(), layer.clone());
    tracker.init_tracking();
    assert_eq!(tracker.collector_state(), LoadState::Loaded);
    tracker.track("click", None);

    page.consent.set(ConsentState::denied());
    tracker.init_tracking();

    assert_eq!(tracker.collector_state(), LoadState::Unloaded);
    let loader = tracker.lifecycle().unwrap().loader_url().to_string();
    assert!(!page
        .document
        .scripts()
        .iter()
        .any(|s| matches_loader(&s.src, &loader)));
    assert!(event_names(&layer.calls()).is_empty());
    assert!(matches!(
        layer.calls().as_slice(),
        [CollectorCall::Consent {
            mode: ConsentMode::Update,
            params,
        }] if params.analytics_storage == ConsentSignal::Denied
    ));
    assert!(matches!(
        tracker
            .lifecycle()
            .unwrap()
            .dispatch(CollectorCall::Set { params: Default::default() }),
        Err(Error::Unavailable)
    ));

    let remaining: Vec<String> = page.cookies.all().into_iter().map(|c| c.name).collect();
    assert!(!remaining.iter().any(|n| is_collector_cookie(n)));
    assert_eq!(remaining, vec!["session"]);
}

#[tokio::test(start_paused = true)]
async fn test_leftover_cookies_removed_without_consent() {
    let page = Page::new(ConsentState::denied());
    page.cookies.seed("_ga", "GA1.1.123", Some(".example.com"), "/");

    let tracker = page.tracker(Config::default(), Arc::new(DataLayer::new()));
    tracker.init_tracking();

    assert!(page.cookies.all().is_empty());
    assert_eq!(tracker.collector_state(), LoadState::Unloaded);
}

// ============================================
// Delivery
// ============================================

#[tokio::test(start_paused = true)]
async fn test_batch_flushes_at_threshold() {
    let page = Page::new(ConsentState::granted());
    let layer = Arc::new(DataLayer::new());
    let mut config = Config::default();
    config.batching.enabled = true;
    config.batching.batch_size = 10;
    let tracker = page.tracker(config, layer.clone());
    tracker.init_tracking();

    for i in 0..9 {
        assert!(tracker.track(&format!("e{}", i), None).is_accepted());
    }
    assert!(event_names(&layer.calls()).is_empty());
    assert_eq!(tracker.pending().batched, 9);

    tracker.track("e9", None);
    let names = event_names(&layer.calls());
    assert_eq!(names.len(), 10);
    assert_eq!(names[0], "e0");
    assert_eq!(names[9], "e9");
    assert_eq!(tracker.stats().batches_flushed, 1);
    assert_eq!(tracker.pending().batched, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_then_queued() {
    let page = Page::new(ConsentState::granted());
    let handle = RecordingHandle::failing();
    let mut config = Config::default();
    config.retry.max_attempts = 4;
    let tracker = page.tracker(config, handle.clone());
    tracker.init_tracking();

    let started = Instant::now();
    assert!(tracker.track("purchase", None).is_accepted());
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let attempts = handle.attempts();
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts[0], started);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );

    assert_eq!(tracker.pending().queued, 1);
    assert_eq!(tracker.stats().queued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_keeps_newest_hundred() {
    let page = Page::new(ConsentState::granted());
    let handle = RecordingHandle::failing();
    let mut config = Config::default();
    config.retry.max_attempts = 1;
    config.rate_limit.max_events = 1_000;
    let tracker = page.tracker(config, handle.clone());
    tracker.init_tracking();

    for i in 0..150 {
        tracker.track(&format!("e{}", i), None);
    }

    assert_eq!(tracker.pending().queued, 100);
    let stats = tracker.stats();
    assert_eq!(stats.queued, 150);
    assert_eq!(stats.evicted, 50);
}

#[tokio::test(start_paused = true)]
async fn test_queued_events_survive_reload() {
    let page = Page::new(ConsentState::granted());
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut config = Config::default();
    config.retry.max_attempts = 1;

    let first = page.tracker_with_store(
        config.clone(),
        RecordingHandle::failing(),
        Some(store.clone()),
    );
    first.init_tracking();
    first.track("checkout", Some(&json!({"step": 2})));
    assert_eq!(first.pending().queued, 1);

    let raw = store.get(QUEUE_STORAGE_KEY).unwrap().unwrap();
    let persisted: Vec<QueuedEvent> = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted[0].event.name, "checkout");
    first.dispose();

    let layer = Arc::new(DataLayer::new());
    let second = page.tracker_with_store(config, layer.clone(), Some(store.clone()));
    assert_eq!(second.pending().queued, 1);

    second.init_tracking();
    assert_eq!(event_names(&layer.calls()), vec!["checkout"]);
    assert_eq!(second.pending().queued, 0);
    assert!(store.get(QUEUE_STORAGE_KEY).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disabling_persistence_removes_durable_copy() {
    let page = Page::new(ConsentState::granted());
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut config = Config::default();
    config.retry.max_attempts = 1;
    let tracker =
        page.tracker_with_store(config, RecordingHandle::failing(), Some(store.clone()));
    tracker.init_tracking();

    tracker.track("a", None);
    assert!(store.get(QUEUE_STORAGE_KEY).unwrap().is_some());

    tracker.set_queue_persistence(false);
    assert!(store.get(QUEUE_STORAGE_KEY).unwrap().is_none());
    assert_eq!(tracker.pending().queued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_revocation_during_retry_drops_event() {
    let page = Page::new(ConsentState::granted());
    let handle = RecordingHandle::failing();
    let tracker = page.tracker(Config::default(), handle.clone());
    tracker.init_tracking();

    tracker.track("purchase", None);
    page.consent.set(ConsentState::denied());
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(tracker.pending().queued, 0);
    assert_eq!(tracker.stats().dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_revocation_stops_retry_even_if_network_recovers() {
    let page = Page::new(ConsentState::granted());
    let handle = RecordingHandle::failing();
    let tracker = page.tracker(Config::default(), handle.clone());
    tracker.init_tracking();

    tracker.track("purchase", None);
    page.consent.set(ConsentState::denied());
    handle.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    // init_tracking was never called again, yet nothing went out.
    assert!(event_names(&handle.layer.calls()).is_empty());
    assert_eq!(handle.attempts().len(), 1);
    assert_eq!(tracker.stats().dispatched, 0);
    assert_eq!(tracker.stats().dropped, 1);
    assert_eq!(tracker.pending().queued, 0);
}
