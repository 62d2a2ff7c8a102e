//! The tracker: public entry point of the pipeline
//!
//! A [`Tracker`] owns one page's worth of pipeline state and is cheap to
//! clone. Its public operations never fail and never panic; problems are
//! reported through the injected logger and counted in [`TrackingStats`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackgate_core::{Config, ConsentState, RuntimeContext, SharedConsent, Tracker};
//!
//! # async fn example(context: RuntimeContext) -> trackgate_core::Result<()> {
//! let consent = SharedConsent::with_state(ConsentState::granted());
//! let tracker = Tracker::builder(Config::load()?)
//!     .context(context)
//!     .consent(Arc::new(consent.clone()))
//!     .build()?;
//!
//! tracker.init_tracking();
//! tracker.track("sign_up", Some(&serde_json::json!({"method": "email"})));
//! # Ok(())
//! # }
//! ```
//!
//! Background work (batch timer, offline-queue interval, retry backoff,
//! load watchdog) runs as tokio tasks holding weak references, so dropping
//! the last tracker clone stops all of it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::collector::{CollectorCall, CollectorLifecycle, LoadState};
use crate::config::Config;
use crate::consent::{ConsentModeSync, ConsentStore, SharedConsent};
use crate::delivery::{retry_with_backoff, BatchBuffer, OfflineQueue, PushOutcome, RetryPolicy};
use crate::error::{Error, Result};
use crate::host::RuntimeContext;
use crate::logging::{Log, LogLevel};
use crate::pipeline::{Decision, Gate, Preflight, RandomSource, Skip, ThreadRandom};
use crate::stats::TrackingStats;
use crate::storage::KeyValueStore;
use crate::types::{ConsentCategory, ConsentState, TrackedEvent};

const COMPONENT: &str = "tracker";

/// Events waiting inside the tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub batched: usize,
    pub queued: usize,
}

pub struct TrackerBuilder {
    config: Config,
    context: RuntimeContext,
    consent: Option<Arc<dyn ConsentStore>>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    log: Log,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl TrackerBuilder {
    pub fn context(mut self, context: RuntimeContext) -> Self {
        self.context = context;
        self
    }

    pub fn consent(mut self, consent: Arc<dyn ConsentStore>) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn log(mut self, log: Log) -> Self {
        self.log = log;
        self
    }

    /// Durable storage for the offline queue. Used when `queue.persist` is on.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the tracker on the current tokio runtime.
    pub fn build(self) -> Result<Tracker> {
        self.config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("tracker needs a tokio runtime: {}", e)))?;

        let consent = self
            .consent
            .unwrap_or_else(|| Arc::new(SharedConsent::undecided()));

        let lifecycle = self.context.host.clone().map(|host| {
            CollectorLifecycle::new(
                host,
                &self.config.collector,
                ConsentModeSync::new(self.config.consent.wait_for_update_ms),
                self.log.clone(),
                runtime.clone(),
            )
        });

        let preflight = Preflight::new(
            &self.config,
            consent.clone(),
            self.random.clone(),
            self.log.clone(),
        );

        let mut queue = OfflineQueue::new(&self.config.queue, self.log.clone());
        if self.config.queue.persist {
            if let Some(store) = &self.store {
                queue.enable_persistence(store.clone());
            }
        }

        let measurement_id = self
            .context
            .measurement_id
            .clone()
            .or_else(|| self.config.collector.measurement_id.clone());
        let production = self.context.production || self.config.collector.production;

        let state = State {
            preflight,
            batching: self.config.batching.enabled,
            batch: BatchBuffer::new(self.config.batching.batch_size),
            queue,
            stats: TrackingStats::default(),
            announced: None,
            queue_timer: None,
            disposed: false,
        };

        let tracker = Tracker {
            inner: Arc::new(Inner {
                retry: self.config.retry.into(),
                batch_timeout: Duration::from_millis(self.config.batching.timeout_ms),
                queue_interval: Duration::from_millis(self.config.queue.flush_interval_ms),
                config: self.config,
                measurement_id,
                production,
                context: self.context,
                consent,
                clock: self.clock,
                log: self.log,
                store: self.store,
                runtime,
                lifecycle,
                state: Mutex::new(state),
            }),
        };
        tracker.ensure_queue_timer();
        Ok(tracker)
    }
}

struct State {
    preflight: Preflight,
    batching: bool,
    batch: BatchBuffer,
    queue: OfflineQueue,
    stats: TrackingStats,
    /// Consent last sent to the collector
    announced: Option<ConsentState>,
    queue_timer: Option<JoinHandle<()>>,
    disposed: bool,
}

struct Inner {
    config: Config,
    measurement_id: Option<String>,
    /// Set by the runtime context or by `collector.production`
    production: bool,
    context: RuntimeContext,
    consent: Arc<dyn ConsentStore>,
    clock: Arc<dyn Clock>,
    log: Log,
    store: Option<Arc<dyn KeyValueStore>>,
    runtime: Handle,
    lifecycle: Option<CollectorLifecycle>,
    retry: RetryPolicy,
    batch_timeout: Duration,
    queue_interval: Duration,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    pub fn builder(config: Config) -> TrackerBuilder {
        TrackerBuilder {
            config,
            context: RuntimeContext::headless(),
            consent: None,
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
            log: Log::default(),
            store: None,
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.inner.context
    }

    pub fn lifecycle(&self) -> Option<&CollectorLifecycle> {
        self.inner.lifecycle.as_ref()
    }

    pub fn collector_state(&self) -> LoadState {
        self.inner
            .lifecycle
            .as_ref()
            .map(|l| l.state())
            .unwrap_or(LoadState::Unloaded)
    }

    pub fn stats(&self) -> TrackingStats {
        self.state().stats.clone()
    }

    pub fn pending(&self) -> Pending {
        let state = self.state();
        Pending {
            batched: state.batch.len(),
            queued: state.queue.len(),
        }
    }

    // ============================================
    // Initialization and consent
    // ============================================

    /// Bring the collector in line with consent and environment.
    ///
    /// Call once at startup and again after every consent change. Loads
    /// the collector only with analytics consent, in production, with a
    /// measurement id. Withdrawn consent unloads it and purges everything
    /// gathered under the old consent.
    pub fn init_tracking(&self) {
        let Some(lifecycle) = &self.inner.lifecycle else {
            self.inner
                .log
                .debug(COMPONENT, "no host page, tracking disabled");
            return;
        };
        if self.state().disposed {
            return;
        }
        self.ensure_queue_timer();

        let consent = self.inner.consent.get_consent();
        let Some(consent) = consent.filter(|c| c.analytics) else {
            self.withdraw(lifecycle);
            return;
        };

        if !self.inner.production {
            self.inner
                .log
                .debug(COMPONENT, "not a production environment, collector not loaded");
            return;
        }
        let Some(measurement_id) = self.inner.measurement_id.as_deref() else {
            self.inner
                .log
                .warn(COMPONENT, "no measurement id configured, collector not loaded");
            return;
        };

        let same_collector = lifecycle.state() != LoadState::Unloaded
            && lifecycle.measurement_id().as_deref() == Some(measurement_id);

        if same_collector {
            if self.state().announced != Some(consent) {
                match lifecycle.update_consent(consent) {
                    Ok(()) => self.state().announced = Some(consent),
                    Err(e) => self.inner.log.warn(COMPONENT, e.to_string()),
                }
            }
            return;
        }

        match lifecycle.load(measurement_id, consent) {
            Ok(()) => {
                self.state().announced = Some(consent);
                self.flush_queue();
            }
            Err(e) => self.inner.log.emit(
                LogLevel::Debug,
                COMPONENT,
                "collector not loaded",
                vec![("error", e.to_string())],
            ),
        }
    }

    fn withdraw(&self, lifecycle: &CollectorLifecycle) {
        if lifecycle.state() != LoadState::Unloaded {
            {
                let mut state = self.state();
                state.batch.clear();
                state.queue.clear();
                state.announced = None;
            }
            lifecycle.revoke();
            self.inner
                .log
                .info(COMPONENT, "analytics consent withdrawn, collector unloaded");
        } else if lifecycle.cleaner().has_collector_cookies() {
            // Cookies left over from an earlier visit.
            lifecycle.unload();
        }
    }

    // ============================================
    // Tracking
    // ============================================

    /// Run an event through preflight and hand it on when accepted.
    ///
    /// A payload that is not a JSON object is ignored with a warning.
    pub fn track(&self, name: &str, payload: Option<&Value>) -> Decision {
        let payload = match payload {
            None => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                self.inner.log.emit(
                    LogLevel::Warn,
                    COMPONENT,
                    "event payload is not an object, ignoring it",
                    vec![("event", name.to_string())],
                );
                None
            }
        };

        let gate = self.gate();
        let now = self.inner.clock.now_millis();

        let mut state = self.state();
        let decision = state
            .preflight
            .evaluate(name, payload, gate, now, Skip::default());

        let event = match &decision {
            Decision::Reject(reason) => {
                state.stats.record_rejection(*reason);
                drop(state);
                self.inner.log.emit(
                    LogLevel::Debug,
                    COMPONENT,
                    "event rejected",
                    vec![("event", name.to_string()), ("reason", reason.to_string())],
                );
                return decision;
            }
            Decision::Accept(event) => event.clone(),
        };
        state.stats.accepted += 1;

        if !state.batching {
            drop(state);
            self.dispatch(event);
            return decision;
        }

        match state.batch.push(event) {
            PushOutcome::Full => {
                let events = state.batch.take();
                drop(state);
                self.flush_events(events);
            }
            PushOutcome::ArmTimer => {
                let timer = self.spawn_batch_timer();
                state.batch.set_timer(timer);
            }
            PushOutcome::Buffered => {}
        }
        decision
    }

    /// Track a page view for `path`.
    pub fn track_page_view(&self, path: &str) -> Decision {
        let mut params = Map::new();
        params.insert("page_path".to_string(), Value::String(path.to_string()));
        if let Some(host) = &self.inner.context.host {
            params.insert(
                "page_location".to_string(),
                Value::String(format!("https://{}{}", host.location.hostname, path)),
            );
        }
        self.track("page_view", Some(&Value::Object(params)))
    }

    fn gate(&self) -> Gate {
        let disposed = self.state().disposed;
        Gate {
            available: self.inner.context.has_host() && !disposed,
            loaded: self
                .inner
                .lifecycle
                .as_ref()
                .is_some_and(|l| l.is_loaded()),
        }
    }

    // ============================================
    // Batching
    // ============================================

    /// Turn batching on or off. Turning it off flushes what is buffered.
    pub fn set_batching(&self, enabled: bool) {
        let events = {
            let mut state = self.state();
            state.batching = enabled;
            if enabled {
                return;
            }
            state.batch.take()
        };
        self.flush_events(events);
    }

    /// Flush the batch buffer now.
    pub fn flush(&self) {
        let events = self.state().batch.take();
        self.flush_events(events);
    }

    /// Re-check each buffered event, then dispatch the survivors in order.
    fn flush_events(&self, events: Vec<TrackedEvent>) {
        if events.is_empty() {
            return;
        }

        let gate = self.gate();
        let now = self.inner.clock.now_millis();
        let mut accepted = Vec::with_capacity(events.len());
        {
            let mut state = self.state();
            state.stats.batches_flushed += 1;
            for event in &events {
                let params = event.payload.as_ref().map(|_| event.params());
                match state
                    .preflight
                    .evaluate(&event.name, params.as_ref(), gate, now, Skip::reevaluation())
                {
                    Decision::Accept(event) => accepted.push(event),
                    Decision::Reject(reason) => {
                        state.stats.record_rejection(reason);
                        self.inner.log.emit(
                            LogLevel::Debug,
                            COMPONENT,
                            "buffered event rejected at flush",
                            vec![("event", event.name.clone()), ("reason", reason.to_string())],
                        );
                    }
                }
            }
        }

        self.inner.log.emit(
            LogLevel::Debug,
            COMPONENT,
            "batch flushed",
            vec![
                ("buffered", events.len().to_string()),
                ("dispatching", accepted.len().to_string()),
            ],
        );
        for event in accepted {
            self.dispatch(event);
        }
    }

    fn spawn_batch_timer(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.batch_timeout;
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let tracker = Tracker::from_inner(inner);
            let events = {
                let mut state = tracker.state();
                state.batch.timer_fired();
                state.batch.take()
            };
            tracker.flush_events(events);
        })
    }

    // ============================================
    // Dispatch
    // ============================================

    /// First attempt happens right away so hand-off order follows call
    /// order; retries continue in the background.
    fn dispatch(&self, event: TrackedEvent) {
        let Some(lifecycle) = &self.inner.lifecycle else {
            self.undeliverable(event, Error::Unavailable);
            return;
        };

        let call = CollectorCall::event(&event);
        let error = match lifecycle.dispatch(call.clone()) {
            Ok(()) => {
                self.delivered();
                return;
            }
            Err(e) => e,
        };

        let policy = self.inner.retry;
        if !error.is_recoverable() || policy.max_attempts <= 1 {
            self.undeliverable(event, error);
            return;
        }

        self.inner.log.emit(
            LogLevel::Debug,
            COMPONENT,
            "dispatch failed, retrying in background",
            vec![("event", event.name.clone()), ("error", error.to_string())],
        );

        let weak = Arc::downgrade(&self.inner);
        let log = self.inner.log.clone();
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(policy.delay_after(0)).await;
            let rest = policy.remaining(1);
            let result = retry_with_backoff(&rest, &log, |_| {
                std::future::ready(redispatch(&weak, &call))
            })
            .await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let tracker = Tracker::from_inner(inner);
            match result {
                Ok(()) => tracker.delivered(),
                Err(e) => tracker.undeliverable(event, e),
            }
        });
    }

    fn delivered(&self) {
        self.state().stats.dispatched += 1;
        self.flush_queue();
    }

    /// Queue an event that could not be delivered, unless the failure is
    /// permanent or consent has gone away in the meantime.
    fn undeliverable(&self, event: TrackedEvent, error: Error) {
        let consented = self.inner.consent.has_consent(ConsentCategory::Analytics);
        let now = self.inner.clock.now_millis();
        let mut state = self.state();
        state.stats.dispatch_failures += 1;

        if !error.is_recoverable() || !consented {
            state.stats.dropped += 1;
            drop(state);
            self.inner.log.emit(
                LogLevel::Warn,
                COMPONENT,
                "dropping undeliverable event",
                vec![("event", event.name), ("error", error.to_string())],
            );
            return;
        }

        let name = event.name.clone();
        if state.queue.enqueue(event, now).is_some() {
            state.stats.evicted += 1;
        }
        state.stats.queued += 1;
        drop(state);
        self.inner.log.emit(
            LogLevel::Debug,
            COMPONENT,
            "event moved to offline queue",
            vec![("event", name), ("error", error.to_string())],
        );
    }

    // ============================================
    // Offline queue
    // ============================================

    /// Resend queued events if the collector is loaded.
    pub fn flush_queue(&self) {
        let Some(lifecycle) = &self.inner.lifecycle else {
            return;
        };
        if !lifecycle.is_loaded()
            || !self.inner.consent.has_consent(ConsentCategory::Analytics)
        {
            return;
        }

        let mut state = self.state();
        if state.queue.is_empty() {
            return;
        }
        let outcome = state
            .queue
            .flush(|event| lifecycle.dispatch(CollectorCall::event(event)));
        state.stats.flushed_from_queue += outcome.sent;
        state.stats.dispatched += outcome.sent;
        state.stats.dropped += outcome.dropped;
    }

    /// Turn durable mirroring of the offline queue on or off.
    ///
    /// Turning it off removes the durable copy. Turning it on without a
    /// configured store does nothing.
    pub fn set_queue_persistence(&self, enabled: bool) {
        let mut state = self.state();
        match (enabled, &self.inner.store) {
            (true, Some(store)) if !state.queue.is_persistent() => {
                state.queue.enable_persistence(store.clone());
            }
            (false, _) => state.queue.disable_persistence(),
            _ => {}
        }
    }

    fn ensure_queue_timer(&self) {
        if !self.inner.context.has_host() {
            return;
        }
        let mut state = self.state();
        if state.queue_timer.is_some() || state.disposed {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.queue_interval;
        state.queue_timer = Some(self.inner.runtime.spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Tracker::from_inner(inner).flush_queue();
            }
        }));
    }

    // ============================================
    // Page lifecycle
    // ============================================

    /// The page became hidden: trim stale window entries.
    pub fn page_hidden(&self) {
        let now = self.inner.clock.now_millis();
        self.state().preflight.prune(now);
    }

    /// The page is going away: flush the batch, stop every timer, and
    /// reset the windows. In-flight retries are not waited for.
    pub fn page_unload(&self) {
        self.flush();
        let mut state = self.state();
        state.batch.clear();
        if let Some(timer) = state.queue_timer.take() {
            timer.abort();
        }
        state.preflight.reset();
    }

    /// Tear everything down, including the collector. Later calls are
    /// rejected as unavailable.
    pub fn dispose(&self) {
        self.page_unload();
        self.state().disposed = true;
        if let Some(lifecycle) = &self.inner.lifecycle {
            lifecycle.unload();
        }
        self.inner.log.debug(COMPONENT, "tracker disposed");
    }

    /// Return every structure to its initial state, including the durable
    /// queue copy. The collector is left as it is.
    pub fn reset(&self) {
        let mut state = self.state();
        state.preflight.reset();
        state.batch.clear();
        state.queue.clear();
        state.stats = TrackingStats::default();
        state.batching = self.inner.config.batching.enabled;
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("context", &self.inner.context)
            .field("collector", &self.collector_state())
            .finish_non_exhaustive()
    }
}

/// One background retry attempt. Consent is re-read first, so a revocation
/// the host has not reported through `init_tracking` yet still stops it.
fn redispatch(weak: &Weak<Inner>, call: &CollectorCall) -> Result<()> {
    let inner = weak
        .upgrade()
        .ok_or_else(|| Error::Runtime("tracker dropped".to_string()))?;
    if !inner.consent.has_consent(ConsentCategory::Analytics) {
        return Err(Error::ConsentWithdrawn);
    }
    match &inner.lifecycle {
        Some(lifecycle) => lifecycle.dispatch(call.clone()),
        None => Err(Error::Unavailable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::{
        DataLayer, DispatchHandle, HostBindings, Location, MemoryCookieJar, MemoryDocument,
    };
    use crate::delivery::QUEUE_STORAGE_KEY;
    use crate::logging::MemoryLogger;
    use crate::pipeline::FixedRandom;
    use crate::storage::MemoryStore;
    use crate::types::RejectReason;
    use serde_json::json;

    const ID: &str = "G-TEST123";

    struct Harness {
        tracker: Tracker,
        clock: ManualClock,
        consent: SharedConsent,
        layer: Arc<DataLayer>,
        logs: Arc<MemoryLogger>,
    }

    fn harness(config: Config, consent: ConsentState) -> Harness {
        let layer = Arc::new(DataLayer::new());
        let host = HostBindings {
            document: Arc::new(MemoryDocument::default()),
            cookies: Arc::new(MemoryCookieJar::new("example.com", "/")),
            dispatch: layer.clone(),
            location: Location::new("example.com", "/"),
        };
        let consent_store = SharedConsent::with_state(consent);
        let logs = Arc::new(MemoryLogger::new());
        let clock = ManualClock::new(1_000);
        let tracker = Tracker::builder(config)
            .context(RuntimeContext::with_host(host).production(true).measurement_id(ID))
            .consent(Arc::new(consent_store.clone()))
            .clock(Arc::new(clock.clone()))
            .random(Arc::new(FixedRandom(0.0)))
            .log(Log::new(logs.clone()))
            .build()
            .unwrap();
        Harness {
            tracker,
            clock,
            consent: consent_store,
            layer,
            logs,
        }
    }

    fn events(layer: &DataLayer) -> Vec<String> {
        layer
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                CollectorCall::Event { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_build_requires_runtime() {
        let err = Tracker::builder(Config::default()).build().unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_headless_tracker_rejects_everything() {
        let tracker = Tracker::builder(Config::default()).build().unwrap();
        tracker.init_tracking();
        assert_eq!(
            tracker.track("click", None).reason(),
            Some(RejectReason::Unavailable)
        );
        assert_eq!(tracker.collector_state(), LoadState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_dispatches_immediately() {
        let h = harness(Config::default(), ConsentState::granted());
        h.tracker.init_tracking();
        assert_eq!(h.tracker.collector_state(), LoadState::Loaded);

        let decision = h.tracker.track("sign_up", Some(&json!({"method": "email"})));
        assert!(decision.is_accepted());
        assert_eq!(events(&h.layer), vec!["sign_up"]);
        assert_eq!(h.tracker.stats().dispatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_view_payload() {
        let h = harness(Config::default(), ConsentState::granted());
        h.tracker.init_tracking();
        h.tracker.track_page_view("/pricing");

        let args = h.layer.to_args();
        let last = args.last().unwrap();
        assert_eq!(last[1], "page_view");
        assert_eq!(last[2]["page_path"], "/pricing");
        assert_eq!(last[2]["page_location"], "https://example.com/pricing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_object_payload_ignored() {
        let h = harness(Config::default(), ConsentState::granted());
        h.tracker.init_tracking();

        let Decision::Accept(event) = h.tracker.track("click", Some(&json!([1, 2]))) else {
            panic!("expected accept");
        };
        assert!(event.payload.is_none());
        assert!(h.logs.contains(LogLevel::Warn, "not an object"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_loaded_outside_production() {
        let layer = Arc::new(DataLayer::new());
        let host = HostBindings {
            document: Arc::new(MemoryDocument::default()),
            cookies: Arc::new(MemoryCookieJar::new("localhost", "/")),
            dispatch: layer.clone(),
            location: Location::new("localhost", "/"),
        };
        let tracker = Tracker::builder(Config::default())
            .context(RuntimeContext::with_host(host).measurement_id(ID))
            .consent(Arc::new(SharedConsent::with_state(ConsentState::granted())))
            .build()
            .unwrap();

        tracker.init_tracking();
        assert_eq!(tracker.collector_state(), LoadState::Unloaded);
        assert_eq!(
            tracker.track("click", None).reason(),
            Some(RejectReason::NotLoaded)
        );
        assert!(layer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_production_flag_from_config() {
        let mut config = Config::default();
        config.collector.production = true;
        let layer = Arc::new(DataLayer::new());
        let host = HostBindings {
            document: Arc::new(MemoryDocument::default()),
            cookies: Arc::new(MemoryCookieJar::new("example.com", "/")),
            dispatch: layer.clone(),
            location: Location::new("example.com", "/"),
        };
        let tracker = Tracker::builder(config)
            .context(RuntimeContext::with_host(host).measurement_id(ID))
            .consent(Arc::new(SharedConsent::with_state(ConsentState::granted())))
            .build()
            .unwrap();

        tracker.init_tracking();
        assert_eq!(tracker.collector_state(), LoadState::Loaded);
        assert!(tracker.track("click", None).is_accepted());
        assert_eq!(events(&layer), vec!["click"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timer_flushes() {
        let mut config = Config::default();
        config.batching.enabled = true;
        let h = harness(config, ConsentState::granted());
        h.tracker.init_tracking();

        h.tracker.track("a", None);
        h.tracker.track("b", None);
        assert!(events(&h.layer).is_empty());
        assert_eq!(h.tracker.pending().batched, 2);

        tokio::time::sleep(Duration::from_millis(2_001)).await;
        assert_eq!(events(&h.layer), vec!["a", "b"]);
        assert_eq!(h.tracker.pending().batched, 0);
        assert_eq!(h.tracker.stats().batches_flushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_batching_flushes() {
        let mut config = Config::default();
        config.batching.enabled = true;
        let h = harness(config, ConsentState::granted());
        h.tracker.init_tracking();

        h.tracker.track("a", None);
        h.tracker.set_batching(false);
        assert_eq!(events(&h.layer), vec!["a"]);

        h.tracker.track("b", None);
        assert_eq!(events(&h.layer), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_revoked_mid_batch() {
        let mut config = Config::default();
        config.batching.enabled = true;
        let h = harness(config, ConsentState::granted());
        h.tracker.init_tracking();

        h.tracker.track("a", None);
        h.consent.set(ConsentState::denied());
        h.tracker.flush();

        assert!(events(&h.layer).is_empty());
        assert_eq!(h.tracker.stats().rejected_for(RejectReason::NoConsent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawal_unloads_and_purges() {
        let h = harness(Config::default(), ConsentState::granted());
        h.tracker.init_tracking();
        assert_eq!(h.tracker.collector_state(), LoadState::Loaded);

        h.consent.set(ConsentState::denied());
        h.tracker.init_tracking();

        assert_eq!(h.tracker.collector_state(), LoadState::Unloaded);
        assert!(events(&h.layer).is_empty());
        let args = h.layer.to_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0][1], "update");
        assert_eq!(args[0][2]["analytics_storage"], "denied");
        assert_eq!(h.tracker.pending(), Pending::default());
        assert_eq!(
            h.tracker.track("click", None).reason(),
            Some(RejectReason::NoConsent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_marketing_change_sends_update() {
        let h = harness(
            Config::default(),
            ConsentState {
                necessary: true,
                analytics: true,
                marketing: false,
            },
        );
        h.tracker.init_tracking();
        let before = h.layer.len();

        h.tracker.init_tracking();
        assert_eq!(h.layer.len(), before);

        h.consent.set(ConsentState::granted());
        h.tracker.init_tracking();

        let args = h.layer.to_args();
        assert_eq!(args.len(), before + 1);
        assert_eq!(args[before][1], "update");
        assert_eq!(args[before][2]["ad_storage"], "granted");
        assert_eq!(h.tracker.collector_state(), LoadState::Loaded);
    }

    /// Fails every event call until told otherwise.
    #[derive(Default)]
    struct FlakyHandle {
        inner: DataLayer,
        failing: std::sync::atomic::AtomicBool,
    }

    impl DispatchHandle for FlakyHandle {
        fn dispatch(&self, call: CollectorCall) -> Result<()> {
            if matches!(call, CollectorCall::Event { .. })
                && self.failing.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(Error::Network("offline".to_string()));
            }
            self.inner.dispatch(call)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_event_queued_then_resent() {
        let handle = Arc::new(FlakyHandle::default());
        handle.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let host = HostBindings {
            document: Arc::new(MemoryDocument::default()),
            cookies: Arc::new(MemoryCookieJar::new("example.com", "/")),
            dispatch: handle.clone(),
            location: Location::new("example.com", "/"),
        };
        let tracker = Tracker::builder(Config::default())
            .context(RuntimeContext::with_host(host).production(true).measurement_id(ID))
            .consent(Arc::new(SharedConsent::with_state(ConsentState::granted())))
            .build()
            .unwrap();
        tracker.init_tracking();

        tracker.track("purchase", None);
        // Retries at +100ms and +300ms, then the event is queued.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(tracker.pending().queued, 1);
        assert_eq!(tracker.stats().dispatch_failures, 1);

        handle.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(tracker.pending().queued, 0);
        assert_eq!(tracker.stats().flushed_from_queue, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_unloads_and_rejects() {
        let h = harness(Config::default(), ConsentState::granted());
        h.tracker.init_tracking();
        h.tracker.dispose();

        assert_eq!(h.tracker.collector_state(), LoadState::Unloaded);
        assert_eq!(
            h.tracker.track("click", None).reason(),
            Some(RejectReason::Unavailable)
        );
        h.tracker.init_tracking();
        assert_eq!(h.tracker.collector_state(), LoadState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_hidden_trims_expired_entries() {
        let mut config = Config::default();
        config.rate_limit.max_events = 2;
        config.rate_limit.window_ms = 1_000;
        let h = harness(config, ConsentState::granted());
        h.tracker.init_tracking();

        assert!(h.tracker.track("a", None).is_accepted());
        assert!(h.tracker.track("b", None).is_accepted());
        assert_eq!(
            h.tracker.track("c", None).reason(),
            Some(RejectReason::RateLimited)
        );

        h.clock.advance(500);
        h.tracker.page_hidden();
        assert_eq!(h.tracker.state().preflight.rate_limiter().active_count(), 2);

        h.clock.advance(501);
        h.tracker.page_hidden();
        assert_eq!(h.tracker.state().preflight.rate_limiter().active_count(), 0);
        assert!(h.tracker.track("c", None).is_accepted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_batch_queue_and_durable_copy() {
        let handle = Arc::new(FlakyHandle::default());
        handle.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let host = HostBindings {
            document: Arc::new(MemoryDocument::default()),
            cookies: Arc::new(MemoryCookieJar::new("example.com", "/")),
            dispatch: handle.clone(),
            location: Location::new("example.com", "/"),
        };
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.retry.max_attempts = 1;
        let tracker = Tracker::builder(config)
            .context(RuntimeContext::with_host(host).production(true).measurement_id(ID))
            .consent(Arc::new(SharedConsent::with_state(ConsentState::granted())))
            .store(store.clone())
            .build()
            .unwrap();
        tracker.init_tracking();

        tracker.track("purchase", None);
        tracker.set_batching(true);
        tracker.track("scroll", None);
        assert_eq!(
            tracker.pending(),
            Pending {
                batched: 1,
                queued: 1
            }
        );
        assert!(store.get(QUEUE_STORAGE_KEY).unwrap().is_some());

        tracker.reset();

        assert_eq!(tracker.pending(), Pending::default());
        assert!(store.get(QUEUE_STORAGE_KEY).unwrap().is_none());
        assert_eq!(tracker.stats(), TrackingStats::default());
        assert_eq!(tracker.collector_state(), LoadState::Loaded);

        // Batching is back to its configured state and dedup forgot "purchase".
        handle.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(tracker.track("purchase", None).is_accepted());
        assert_eq!(tracker.pending(), Pending::default());
        assert_eq!(tracker.stats().dispatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_unload_resets_windows() {
        let h = harness(Config::default(), ConsentState::granted());
        h.tracker.init_tracking();
        assert!(h.tracker.track("a", None).is_accepted());
        assert_eq!(
            h.tracker.track("a", None).reason(),
            Some(RejectReason::Duplicate)
        );

        h.tracker.page_unload();
        assert!(h.tracker.track("a", None).is_accepted());
    }
}
