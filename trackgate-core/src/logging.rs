//! Logging infrastructure for trackgate
//!
//! Two layers live here:
//! - [`init`] wires `tracing` to a rotating log file under the XDG state
//!   directory (`~/.local/state/trackgate/trackgate.log`).
//! - [`Logger`] is the injectable port every pipeline component reports
//!   through. [`TracingLogger`] forwards to `tracing`; [`MemoryLogger`]
//!   captures records so tests can assert on warnings.
//!
//! Logging never fails: a logger that cannot write drops the record.

use crate::config::{Config, LoggingConfig};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the logging system
///
/// Sets up tracing with:
/// - File output to XDG state directory
/// - Log rotation
/// - Configurable log level via config or RUST_LOG env var
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "trackgate.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Returns the log file path
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

// ============================================
// Logger port
// ============================================

/// Severity of a [`LogRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured log entry emitted by a pipeline component.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Emitting component, e.g. `"rate_limit"` or `"lifecycle"`
    pub component: &'static str,
    pub message: String,
    pub fields: Vec<(&'static str, String)>,
}

/// Sink for pipeline log records. Implementations must not panic.
pub trait Logger: Send + Sync {
    fn log(&self, record: LogRecord);
}

/// Forwards records to the global `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, record: LogRecord) {
        let fields = format_fields(&record.fields);
        let component = record.component;
        let message = record.message.as_str();
        match record.level {
            LogLevel::Debug => tracing::debug!(component, fields = %fields, "{}", message),
            LogLevel::Info => tracing::info!(component, fields = %fields, "{}", message),
            LogLevel::Warn => tracing::warn!(component, fields = %fields, "{}", message),
            LogLevel::Error => tracing::error!(component, fields = %fields, "{}", message),
        }
    }
}

fn format_fields(fields: &[(&'static str, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Captures records in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record logged so far
    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of records at exactly `level`
    pub fn count(&self, level: LogLevel) -> usize {
        self.records().iter().filter(|r| r.level == level).count()
    }

    /// Whether any record at `level` contains `needle` in its message
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn log(&self, record: LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// Cloneable handle components hold to report through a [`Logger`].
#[derive(Clone)]
pub struct Log {
    sink: Arc<dyn Logger>,
}

impl Log {
    pub fn new(sink: Arc<dyn Logger>) -> Self {
        Self { sink }
    }

    /// A handle that forwards to `tracing`
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingLogger))
    }

    pub fn emit(
        &self,
        level: LogLevel,
        component: &'static str,
        message: impl Into<String>,
        fields: Vec<(&'static str, String)>,
    ) {
        self.sink.log(LogRecord {
            level,
            component,
            message: message.into(),
            fields,
        });
    }

    pub fn debug(&self, component: &'static str, message: impl Into<String>) {
        self.emit(LogLevel::Debug, component, message, Vec::new());
    }

    pub fn info(&self, component: &'static str, message: impl Into<String>) {
        self.emit(LogLevel::Info, component, message, Vec::new());
    }

    pub fn warn(&self, component: &'static str, message: impl Into<String>) {
        self.emit(LogLevel::Warn, component, message, Vec::new());
    }

    pub fn error(&self, component: &'static str, message: impl Into<String>) {
        self.emit(LogLevel::Error, component, message, Vec::new());
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::tracing()
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").finish_non_exhaustive()
    }
}
