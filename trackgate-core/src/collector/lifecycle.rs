//! Loading and unloading the collector
//!
//! ```text
//!            load()              script loaded
//! Unloaded ─────────▶ Loading ─────────────────▶ Loaded
//!     ▲                  │                         │
//!     └── script error ──┘◀──────── unload() ──────┘
//! ```
//!
//! Every load bumps a generation counter. Script outcomes and watchdog
//! timers carry the generation they were started under and are ignored
//! once it has moved on, so a slow script from before an unload can never
//! mark a later load as finished.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;

use super::call::CollectorCall;
use super::cookies::{CleanupReport, CookieCleaner};
use super::loader::{loader_src, matches_loader, validate_measurement_id};
use crate::config::CollectorConfig;
use crate::consent::ConsentModeSync;
use crate::error::{Error, Result};
use crate::host::{DispatchHandle, HostBindings, ScriptId, ScriptOutcome};
use crate::logging::{Log, LogLevel};
use crate::types::ConsentState;

const COMPONENT: &str = "lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
        }
    }
}

/// What an unload removed
#[derive(Debug, Clone, Default)]
pub struct UnloadReport {
    /// Script elements removed from the document
    pub scripts_removed: usize,
    /// Loader scripts still present after removal
    pub scripts_remaining: usize,
    pub cookies: CleanupReport,
}

struct LoadSlot {
    state: LoadState,
    generation: u64,
    measurement_id: Option<String>,
    handle: Option<Arc<dyn DispatchHandle>>,
    scripts: Vec<ScriptId>,
    load_started_at: Option<DateTime<Utc>>,
    watchdog: Option<JoinHandle<()>>,
    outcome_task: Option<JoinHandle<()>>,
}

impl LoadSlot {
    fn new() -> Self {
        Self {
            state: LoadState::Unloaded,
            generation: 0,
            measurement_id: None,
            handle: None,
            scripts: Vec::new(),
            load_started_at: None,
            watchdog: None,
            outcome_task: None,
        }
    }

    /// Return to `Unloaded`, handing back what the caller must tear down.
    fn reset(&mut self) -> Teardown {
        self.generation += 1;
        self.state = LoadState::Unloaded;
        self.load_started_at = None;
        Teardown {
            measurement_id: self.measurement_id.take(),
            handle: self.handle.take(),
            scripts: std::mem::take(&mut self.scripts),
            watchdog: self.watchdog.take(),
            outcome_task: self.outcome_task.take(),
        }
    }
}

struct Teardown {
    measurement_id: Option<String>,
    handle: Option<Arc<dyn DispatchHandle>>,
    scripts: Vec<ScriptId>,
    watchdog: Option<JoinHandle<()>>,
    outcome_task: Option<JoinHandle<()>>,
}

impl Teardown {
    fn abort_timers(&mut self) {
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
        if let Some(task) = self.outcome_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    host: HostBindings,
    loader_url: String,
    load_timeout: Duration,
    consent_mode: ConsentModeSync,
    cleaner: CookieCleaner,
    log: Log,
    runtime: Handle,
    slot: Mutex<LoadSlot>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, LoadSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_scripts(&self, ids: &[ScriptId]) -> usize {
        ids.iter()
            .filter(|id| self.host.document.remove_script(**id))
            .count()
    }

    fn apply_outcome(&self, generation: u64, outcome: ScriptOutcome) {
        let mut slot = self.slot();
        if slot.generation != generation || slot.state != LoadState::Loading {
            drop(slot);
            self.log.debug(COMPONENT, "ignoring outcome of a superseded script");
            return;
        }

        match outcome {
            ScriptOutcome::Loaded => {
                slot.state = LoadState::Loaded;
                if let Some(task) = slot.watchdog.take() {
                    task.abort();
                }
                let elapsed = slot
                    .load_started_at
                    .map(|at| (Utc::now() - at).num_milliseconds())
                    .unwrap_or_default();
                let id = slot.measurement_id.clone().unwrap_or_default();
                drop(slot);
                self.log.emit(
                    LogLevel::Info,
                    COMPONENT,
                    "collector loaded",
                    vec![("measurement_id", id), ("elapsed_ms", elapsed.to_string())],
                );
            }
            ScriptOutcome::Failed(reason) => {
                let mut teardown = slot.reset();
                drop(slot);
                teardown.abort_timers();
                self.remove_scripts(&teardown.scripts);
                let err = Error::ScriptLoad(reason);
                self.log.emit(
                    LogLevel::Error,
                    COMPONENT,
                    "collector script failed to load",
                    vec![
                        ("measurement_id", teardown.measurement_id.unwrap_or_default()),
                        ("error", err.to_string()),
                    ],
                );
            }
        }
    }
}

/// Owns the collector's script, dispatch handle and cookies on one page.
#[derive(Clone)]
pub struct CollectorLifecycle {
    shared: Arc<Shared>,
}

impl CollectorLifecycle {
    pub fn new(
        host: HostBindings,
        config: &CollectorConfig,
        consent_mode: ConsentModeSync,
        log: Log,
        runtime: Handle,
    ) -> Self {
        let cleaner = CookieCleaner::new(host.cookies.clone(), host.location.clone(), log.clone());
        Self {
            shared: Arc::new(Shared {
                host,
                loader_url: config.loader_url.clone(),
                load_timeout: config.load_timeout(),
                consent_mode,
                cleaner,
                log,
                runtime,
                slot: Mutex::new(LoadSlot::new()),
            }),
        }
    }

    pub fn state(&self) -> LoadState {
        self.shared.slot().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == LoadState::Loaded
    }

    pub fn measurement_id(&self) -> Option<String> {
        self.shared.slot().measurement_id.clone()
    }

    pub fn load_started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.slot().load_started_at
    }

    pub fn loader_url(&self) -> &str {
        &self.shared.loader_url
    }

    pub fn cleaner(&self) -> &CookieCleaner {
        &self.shared.cleaner
    }

    /// Load the collector for `measurement_id`.
    ///
    /// A call while loading or loaded with the same id does nothing; a
    /// different id unloads first. An invalid id or a failed script
    /// insertion resets to `Unloaded` and returns the error.
    pub fn load(&self, measurement_id: &str, consent: ConsentState) -> Result<()> {
        let current = {
            let slot = self.shared.slot();
            (slot.state, slot.measurement_id.clone())
        };
        match current {
            (LoadState::Unloaded, _) => {}
            (_, Some(id)) if id == measurement_id => {
                self.shared.log.debug(COMPONENT, "collector already loading or loaded");
                return Ok(());
            }
            _ => {
                self.shared
                    .log
                    .info(COMPONENT, "measurement id changed, reloading collector");
                self.unload();
            }
        }

        if let Err(e) = validate_measurement_id(measurement_id) {
            self.fail_load(&e);
            return Err(e);
        }

        let (generation, handle) = {
            let mut slot = self.shared.slot();
            slot.generation += 1;
            slot.state = LoadState::Loading;
            slot.measurement_id = Some(measurement_id.to_string());
            slot.load_started_at = Some(Utc::now());
            let handle = slot
                .handle
                .get_or_insert_with(|| self.shared.host.dispatch.clone())
                .clone();
            (slot.generation, handle)
        };

        if let Err(e) = self.shared.consent_mode.init_consent_mode(
            handle.as_ref(),
            consent.analytics,
            consent.marketing,
        ) {
            self.shared.log.warn(COMPONENT, e.to_string());
        }

        if let Err(e) = configure(handle.as_ref(), measurement_id) {
            // Never let the script run without its privacy defaults.
            self.fail_load(&e);
            return Err(e);
        }

        let src = loader_src(&self.shared.loader_url, measurement_id);
        let mut element = match self.shared.host.document.append_script(&src) {
            Ok(element) => element,
            Err(e) => {
                let e = Error::ScriptLoad(format!("could not insert {}: {}", src, e));
                self.fail_load(&e);
                return Err(e);
            }
        };

        self.shared.log.emit(
            LogLevel::Debug,
            COMPONENT,
            "collector script injected",
            vec![("src", src)],
        );

        {
            let mut slot = self.shared.slot();
            slot.scripts.push(element.id);
            slot.watchdog = Some(self.arm_watchdog(generation));
        }

        match element.outcome.try_recv() {
            Ok(outcome) => self.shared.apply_outcome(generation, outcome),
            Err(TryRecvError::Closed) => self.shared.apply_outcome(
                generation,
                ScriptOutcome::Failed("script removed before it loaded".to_string()),
            ),
            Err(TryRecvError::Empty) => {
                let weak = Arc::downgrade(&self.shared);
                let task = self.shared.runtime.spawn(async move {
                    let Ok(outcome) = element.outcome.await else {
                        return;
                    };
                    if let Some(shared) = weak.upgrade() {
                        shared.apply_outcome(generation, outcome);
                    }
                });
                let mut slot = self.shared.slot();
                if slot.generation == generation {
                    slot.outcome_task = Some(task);
                } else {
                    task.abort();
                }
            }
        }

        Ok(())
    }

    /// Remove every trace of the collector from the page.
    ///
    /// Safe to call in any state. Cookie cleanup runs even when nothing
    /// was loaded, so cookies left by an earlier visit are removed too.
    pub fn unload(&self) -> UnloadReport {
        let mut teardown = self.shared.slot().reset();
        let mut report = UnloadReport::default();

        match &teardown.handle {
            Some(handle) => handle.clear_buffer(),
            None => self.shared.host.dispatch.clear_buffer(),
        }
        drop(teardown.handle.take());

        report.scripts_removed = self.shared.remove_scripts(&teardown.scripts);
        let strays: Vec<ScriptId> = self.loader_scripts();
        report.scripts_removed += self.shared.remove_scripts(&strays);

        teardown.abort_timers();

        report.cookies = self
            .shared
            .cleaner
            .delete_all_cookies(teardown.measurement_id.as_deref());

        report.scripts_remaining = self.loader_scripts().len();
        if report.scripts_remaining > 0 {
            self.shared.log.emit(
                LogLevel::Warn,
                COMPONENT,
                "collector scripts still present after unload",
                vec![("count", report.scripts_remaining.to_string())],
            );
        }

        self.shared.log.emit(
            LogLevel::Info,
            COMPONENT,
            "collector unloaded",
            vec![
                ("scripts_removed", report.scripts_removed.to_string()),
                ("cookie_writes", report.cookies.writes.to_string()),
            ],
        );

        report
    }

    /// Unload after consent was withdrawn.
    ///
    /// The all-denied consent `update` goes onto the page's data layer
    /// after the buffer is cleared, so it is the last command any collector
    /// code still on the page sees.
    pub fn revoke(&self) -> UnloadReport {
        let report = self.unload();
        if let Err(e) = self.shared.consent_mode.update_consent_mode(
            self.shared.host.dispatch.as_ref(),
            false,
            false,
        ) {
            self.shared.log.emit(
                LogLevel::Warn,
                COMPONENT,
                "consent revocation not delivered",
                vec![("error", e.to_string())],
            );
        }
        report
    }

    /// Hand a call to the collector. Only allowed once loaded.
    pub fn dispatch(&self, call: CollectorCall) -> Result<()> {
        let handle = {
            let slot = self.shared.slot();
            if slot.state != LoadState::Loaded {
                return Err(Error::Unavailable);
            }
            slot.handle.clone().ok_or(Error::Unavailable)?
        };
        handle.dispatch(call)
    }

    /// Send a consent `update` through the installed handle.
    pub fn update_consent(&self, consent: ConsentState) -> Result<()> {
        let handle = self.shared.slot().handle.clone().ok_or(Error::Unavailable)?;
        self.shared
            .consent_mode
            .update_consent_mode(handle.as_ref(), consent.analytics, consent.marketing)
    }

    fn loader_scripts(&self) -> Vec<ScriptId> {
        self.shared
            .host
            .document
            .scripts()
            .into_iter()
            .filter(|s| matches_loader(&s.src, &self.shared.loader_url))
            .map(|s| s.id)
            .collect()
    }

    fn fail_load(&self, error: &Error) {
        let mut teardown = self.shared.slot().reset();
        teardown.abort_timers();
        self.shared.remove_scripts(&teardown.scripts);
        self.shared.log.emit(
            LogLevel::Error,
            COMPONENT,
            "collector load failed",
            vec![("error", error.to_string())],
        );
    }

    fn arm_watchdog(&self, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let timeout = self.shared.load_timeout;
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let still_loading = {
                let slot = shared.slot();
                slot.generation == generation && slot.state == LoadState::Loading
            };
            if still_loading {
                shared.log.emit(
                    LogLevel::Warn,
                    COMPONENT,
                    "collector script still loading, continuing to wait",
                    vec![("timeout_ms", timeout.as_millis().to_string())],
                );
            }
        })
    }
}

impl std::fmt::Debug for CollectorLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorLifecycle")
            .field("state", &self.state())
            .field("measurement_id", &self.measurement_id())
            .finish()
    }
}

/// Start-of-session and privacy defaults, sent before the script loads.
fn configure(handle: &dyn DispatchHandle, measurement_id: &str) -> Result<()> {
    handle.dispatch(CollectorCall::Js(Utc::now()))?;

    let mut params = Map::new();
    params.insert("anonymize_ip".to_string(), Value::Bool(true));
    params.insert("allow_google_signals".to_string(), Value::Bool(false));
    params.insert(
        "allow_ad_personalization_signals".to_string(),
        Value::Bool(false),
    );
    // Page views are sent explicitly.
    params.insert("send_page_view".to_string(), Value::Bool(false));

    handle.dispatch(CollectorCall::Config {
        target: measurement_id.to_string(),
        params,
    })
}
