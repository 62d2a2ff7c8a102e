//! In-process host implementations
//!
//! Used by the CLI harness and by tests. [`MemoryCookieJar`] follows browser
//! cookie identity: a cookie is keyed by name, domain and path, and deleting
//! it requires writing an expired cookie with the same domain and path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use super::{CookieJar, DispatchHandle, Document, ScriptElement, ScriptId, ScriptInfo, ScriptOutcome};
use crate::collector::CollectorCall;
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================
// DataLayer
// ============================================

/// Append-only buffer behind the default dispatch handle
///
/// The collector script drains it; until then calls accumulate in order.
#[derive(Debug, Default)]
pub struct DataLayer {
    calls: Mutex<Vec<CollectorCall>>,
}

impl DataLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of buffered calls
    pub fn calls(&self) -> Vec<CollectorCall> {
        lock(&self.calls).clone()
    }

    /// Take every buffered call, as the collector script does
    pub fn drain(&self) -> Vec<CollectorCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    /// Buffered calls as the argument arrays pushed to the page
    pub fn to_args(&self) -> Vec<serde_json::Value> {
        lock(&self.calls).iter().map(CollectorCall::to_args).collect()
    }
}

impl DispatchHandle for DataLayer {
    fn dispatch(&self, call: CollectorCall) -> Result<()> {
        lock(&self.calls).push(call);
        Ok(())
    }

    fn clear_buffer(&self) {
        lock(&self.calls).clear();
    }
}

// ============================================
// MemoryDocument
// ============================================

/// What happens to scripts appended to a [`MemoryDocument`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptBehavior {
    /// Resolve as loaded right away
    Load,
    /// Resolve as failed right away
    Fail,
    /// Stay pending until [`MemoryDocument::resolve`]
    Pending,
}

#[derive(Debug)]
struct DocumentState {
    next_id: ScriptId,
    scripts: Vec<ScriptInfo>,
    pending: HashMap<ScriptId, oneshot::Sender<ScriptOutcome>>,
    behavior: ScriptBehavior,
}

#[derive(Debug)]
pub struct MemoryDocument {
    state: Mutex<DocumentState>,
}

impl MemoryDocument {
    pub fn new(behavior: ScriptBehavior) -> Self {
        Self {
            state: Mutex::new(DocumentState {
                next_id: 1,
                scripts: Vec::new(),
                pending: HashMap::new(),
                behavior,
            }),
        }
    }

    pub fn set_behavior(&self, behavior: ScriptBehavior) {
        lock(&self.state).behavior = behavior;
    }

    /// Complete a pending script load. Returns false if it is not pending.
    pub fn resolve(&self, id: ScriptId, outcome: ScriptOutcome) -> bool {
        let sender = lock(&self.state).pending.remove(&id);
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn pending_ids(&self) -> Vec<ScriptId> {
        let mut ids: Vec<ScriptId> = lock(&self.state).pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Insert a script element this pipeline does not know about.
    pub fn add_foreign_script(&self, src: &str) -> ScriptId {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.scripts.push(ScriptInfo {
            id,
            src: src.to_string(),
        });
        id
    }
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new(ScriptBehavior::Load)
    }
}

impl Document for MemoryDocument {
    fn append_script(&self, src: &str) -> Result<ScriptElement> {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.scripts.push(ScriptInfo {
            id,
            src: src.to_string(),
        });

        let (tx, rx) = oneshot::channel();
        match state.behavior {
            ScriptBehavior::Load => {
                let _ = tx.send(ScriptOutcome::Loaded);
            }
            ScriptBehavior::Fail => {
                let _ = tx.send(ScriptOutcome::Failed(format!("failed to load {}", src)));
            }
            ScriptBehavior::Pending => {
                state.pending.insert(id, tx);
            }
        }

        Ok(ScriptElement { id, outcome: rx })
    }

    fn remove_script(&self, id: ScriptId) -> bool {
        let mut state = lock(&self.state);
        state.pending.remove(&id);
        let before = state.scripts.len();
        state.scripts.retain(|s| s.id != id);
        state.scripts.len() != before
    }

    fn scripts(&self) -> Vec<ScriptInfo> {
        lock(&self.state).scripts.clone()
    }
}

// ============================================
// MemoryCookieJar
// ============================================

/// A stored cookie. `domain` is `None` for host-only cookies and is kept
/// without a leading dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: String,
}

#[derive(Debug)]
pub struct MemoryCookieJar {
    hostname: String,
    pathname: String,
    writable: bool,
    cookies: Mutex<Vec<StoredCookie>>,
    writes: AtomicUsize,
    probes: AtomicUsize,
}

impl MemoryCookieJar {
    pub fn new(hostname: impl Into<String>, pathname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into().to_ascii_lowercase(),
            pathname: pathname.into(),
            writable: true,
            cookies: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    /// A jar that refuses every write
    pub fn read_only(hostname: impl Into<String>, pathname: impl Into<String>) -> Self {
        Self {
            writable: false,
            ..Self::new(hostname, pathname)
        }
    }

    /// Seed a cookie directly, bypassing attribute parsing.
    pub fn seed(&self, name: &str, value: &str, domain: Option<&str>, path: &str) {
        let cookie = StoredCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.map(normalize_domain),
            path: path.to_string(),
        };
        let mut cookies = lock(&self.cookies);
        cookies.retain(|c| !same_identity(c, &cookie));
        cookies.push(cookie);
    }

    /// Every stored cookie regardless of visibility
    pub fn all(&self) -> Vec<StoredCookie> {
        lock(&self.cookies).clone()
    }

    /// Number of successful raw writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn domain_matches(&self, domain: &Option<String>) -> bool {
        match domain {
            None => true,
            Some(d) => self.hostname == *d || self.hostname.ends_with(&format!(".{}", d)),
        }
    }

    fn path_matches(&self, path: &str) -> bool {
        if path == "/" || self.pathname == path {
            return true;
        }
        let prefix = path.trim_end_matches('/');
        self.pathname.starts_with(&format!("{}/", prefix))
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').to_ascii_lowercase()
}

fn same_identity(a: &StoredCookie, b: &StoredCookie) -> bool {
    a.name == b.name && a.domain == b.domain && a.path == b.path
}

impl CookieJar for MemoryCookieJar {
    fn cookie_names(&self) -> Vec<String> {
        lock(&self.cookies)
            .iter()
            .filter(|c| self.domain_matches(&c.domain) && self.path_matches(&c.path))
            .map(|c| c.name.clone())
            .collect()
    }

    fn write(&self, assignment: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::CookiesUnsupported);
        }

        let mut parts = assignment.split(';').map(str::trim);
        let pair = parts.next().unwrap_or_default();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::CookieDeletion(format!("malformed cookie: {}", assignment)))?;

        let mut cookie = StoredCookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            domain: None,
            path: "/".to_string(),
        };
        let mut expired = false;

        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "path" => cookie.path = val.trim().to_string(),
                "domain" => {
                    let domain = normalize_domain(val.trim());
                    if !self.domain_matches(&Some(domain.clone())) {
                        // Browsers silently ignore cookies for foreign domains.
                        return Ok(());
                    }
                    cookie.domain = Some(domain);
                }
                "expires" => {
                    if let Ok(at) = DateTime::parse_from_rfc2822(val.trim()) {
                        expired = at.with_timezone(&Utc) <= Utc::now();
                    }
                }
                "max-age" => {
                    if let Ok(secs) = val.trim().parse::<i64>() {
                        expired = secs <= 0;
                    }
                }
                _ => {}
            }
        }

        if cookie.name.is_empty() {
            return Err(Error::CookieDeletion(format!(
                "cookie without a name: {}",
                assignment
            )));
        }

        let mut cookies = lock(&self.cookies);
        cookies.retain(|c| !same_identity(c, &cookie));
        if !expired {
            cookies.push(cookie);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn probe_writable(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if !self.writable {
            return false;
        }
        let probe = "__trackgate_probe";
        if self.write(&format!("{}=1; path=/", probe)).is_err() {
            return false;
        }
        let visible = self.cookie_names().iter().any(|n| n == probe);
        let _ = self.write(&format!(
            "{}=; expires=Thu, 01 Jan 1970 00:00:00 GMT; path=/",
            probe
        ));
        visible
    }
}
