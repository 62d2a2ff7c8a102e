//! Removal of the collector's cookies
//!
//! A cookie only disappears when an expired cookie is written with exactly
//! its name, path and domain, none of which can be read back. Cleanup
//! therefore writes expirations across every plausible path and domain.
//!
//! The fast path expires each name at the root path across all candidate
//! domains, which covers how the collector normally sets them, and only
//! walks the remaining paths for names still visible afterwards.
//! [`CleanupStrategy::Exhaustive`] always walks every combination.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use crate::host::{CookieJar, Location};
use crate::logging::{Log, LogLevel};

/// Cookie names the collector is known to set
pub const KNOWN_COOKIE_NAMES: &[&str] = &["_ga", "_gid", "_gat", "_gat_gtag", "_gac_gb"];

/// Prefixes of analytics (`_ga*`), client id (`_gid`) and throttle (`_gat*`) cookies
pub const COOKIE_PREFIXES: &[&str] = &["_ga", "_gid", "_gat"];

const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupStrategy {
    /// Root path first, other paths only for survivors
    #[default]
    FastPath,
    /// Every name × path × domain combination
    Exhaustive,
}

/// What a cleanup pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Cleanup was skipped because cookies cannot be written
    pub skipped: bool,
    /// Cookie names expiration was attempted for
    pub candidates: Vec<String>,
    /// Names that needed the full path walk
    pub slow_path: Vec<String>,
    /// Names still visible afterwards
    pub remaining: Vec<String>,
    /// Expiration writes issued
    pub writes: usize,
    /// Writes the jar rejected
    pub failed_writes: usize,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.remaining.is_empty()
    }
}

pub struct CookieCleaner {
    jar: Arc<dyn CookieJar>,
    location: Location,
    strategy: CleanupStrategy,
    writable: OnceLock<bool>,
    log: Log,
}

impl CookieCleaner {
    pub fn new(jar: Arc<dyn CookieJar>, location: Location, log: Log) -> Self {
        Self {
            jar,
            location,
            strategy: CleanupStrategy::default(),
            writable: OnceLock::new(),
            log,
        }
    }

    pub fn with_strategy(mut self, strategy: CleanupStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Cookie support, probed on first use only.
    pub fn is_supported(&self) -> bool {
        *self.writable.get_or_init(|| self.jar.probe_writable())
    }

    /// Whether any collector cookie is visible from this location
    pub fn has_collector_cookies(&self) -> bool {
        self.jar.cookie_names().iter().any(|n| is_collector_cookie(n))
    }

    /// Expire every collector cookie visible from this location.
    ///
    /// `measurement_id` adds the measurement-scoped names. Never fails;
    /// unsupported hosts are skipped with a warning.
    pub fn delete_all_cookies(&self, measurement_id: Option<&str>) -> CleanupReport {
        let mut report = CleanupReport::default();

        if !self.is_supported() {
            self.log
                .warn("cookies", "cookies are not writable on this host, skipping cleanup");
            report.skipped = true;
            return report;
        }

        let names = self.candidate_names(measurement_id);
        let paths = candidate_paths(&self.location.pathname);
        let domains = candidate_domains(&self.location.hostname);

        let slow: Vec<String> = match self.strategy {
            CleanupStrategy::Exhaustive => names.clone(),
            CleanupStrategy::FastPath => {
                for name in &names {
                    for domain in &domains {
                        self.expire(name, "/", domain.as_deref(), &mut report);
                    }
                }
                let visible = self.visible_names();
                names
                    .iter()
                    .filter(|n| visible.contains(n.as_str()))
                    .cloned()
                    .collect()
            }
        };

        for name in &slow {
            for path in &paths {
                if self.strategy == CleanupStrategy::FastPath && path == "/" {
                    continue;
                }
                for domain in &domains {
                    self.expire(name, path, domain.as_deref(), &mut report);
                }
            }
        }

        let visible = self.visible_names();
        report.remaining = names
            .iter()
            .filter(|n| visible.contains(n.as_str()))
            .cloned()
            .collect();
        report.candidates = names;
        report.slow_path = slow;

        if !report.remaining.is_empty() {
            self.log.emit(
                LogLevel::Warn,
                "cookies",
                "collector cookies survived cleanup",
                vec![("remaining", report.remaining.join(","))],
            );
        } else {
            self.log.emit(
                LogLevel::Debug,
                "cookies",
                "collector cookies cleared",
                vec![("writes", report.writes.to_string())],
            );
        }

        report
    }

    fn candidate_names(&self, measurement_id: Option<&str>) -> Vec<String> {
        let mut names: BTreeSet<String> = KNOWN_COOKIE_NAMES.iter().map(|s| s.to_string()).collect();

        names.extend(
            self.jar
                .cookie_names()
                .into_iter()
                .filter(|n| is_collector_cookie(n)),
        );

        if let Some(id) = measurement_id {
            names.extend(measurement_cookie_names(id));
        }

        names.into_iter().collect()
    }

    fn visible_names(&self) -> BTreeSet<String> {
        self.jar.cookie_names().into_iter().collect()
    }

    fn expire(&self, name: &str, path: &str, domain: Option<&str>, report: &mut CleanupReport) {
        let assignment = expire_assignment(name, path, domain);
        report.writes += 1;
        if let Err(e) = self.jar.write(&assignment) {
            report.failed_writes += 1;
            self.log.emit(
                LogLevel::Debug,
                "cookies",
                "cookie expiration write failed",
                vec![("cookie", name.to_string()), ("error", e.to_string())],
            );
        }
    }
}

/// Whether a cookie name belongs to the collector
pub fn is_collector_cookie(name: &str) -> bool {
    COOKIE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Names scoped to one measurement id (`_ga_<token>`, `_gat_gtag_<id>`)
pub fn measurement_cookie_names(measurement_id: &str) -> Vec<String> {
    let token = measurement_id
        .strip_prefix("G-")
        .unwrap_or(measurement_id)
        .replace('-', "_");
    vec![
        format!("_ga_{}", token),
        format!("_gat_gtag_{}", measurement_id.replace('-', "_")),
    ]
}

/// `name=; expires=<epoch>; path=<path>[; domain=<domain>]`
pub fn expire_assignment(name: &str, path: &str, domain: Option<&str>) -> String {
    match domain {
        Some(d) => format!("{}=; expires={}; path={}; domain={}", name, EPOCH_EXPIRES, path, d),
        None => format!("{}=; expires={}; path={}", name, EPOCH_EXPIRES, path),
    }
}

/// Root, the current path and every ancestor of it, root first.
pub fn candidate_paths(pathname: &str) -> Vec<String> {
    let mut paths = vec!["/".to_string()];
    let mut current = String::new();
    for segment in pathname.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        paths.push(current.clone());
    }
    let trimmed = pathname.trim_end_matches('/');
    if !trimmed.is_empty() && pathname.ends_with('/') {
        paths.push(format!("{}/", trimmed));
    }
    paths.dedup();
    paths
}

/// Unset, the hostname, and the registrable parent (last two labels).
///
/// IP addresses and single-label hosts only get the unset domain.
pub fn candidate_domains(hostname: &str) -> Vec<Option<String>> {
    let host = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    let mut domains = vec![None];

    if host.is_empty() || host.parse::<std::net::IpAddr>().is_ok() || !host.contains('.') {
        return domains;
    }

    let labels: Vec<&str> = host.split('.').collect();
    let parent = labels[labels.len() - 2..].join(".");
    domains.push(Some(format!(".{}", parent)));
    if host != parent {
        domains.push(Some(host));
    }
    domains
}
