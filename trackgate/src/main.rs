//! trackgate - inspect and exercise the analytics event pipeline
//!
//! This tool provides commands for:
//! - Checking configuration and collector settings
//! - Replaying recorded events through a tracker bound to an in-memory page
//! - Inspecting or clearing the durable offline queue
//!
//! File locations follow the XDG base directory layout:
//! - Storage: $XDG_DATA_HOME/trackgate/storage.db (~/.local/share/trackgate/storage.db)
//! - Config: $XDG_CONFIG_HOME/trackgate/config.toml (~/.config/trackgate/config.toml)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use trackgate_core::collector::{loader_src, validate_measurement_id};
use trackgate_core::delivery::{read_persisted, RetryPolicy, QUEUE_STORAGE_KEY};
use trackgate_core::host::{DataLayer, DispatchHandle, MemoryCookieJar, MemoryDocument};
use trackgate_core::{
    CollectorCall, Config, ConsentState, Decision, HostBindings, KeyValueStore, Location, Log,
    RuntimeContext, SharedConsent, SqliteStore, Tracker, TrackingStats,
};

/// Used for replays when no measurement id is configured
const PLACEHOLDER_MEASUREMENT_ID: &str = "G-REPLAY0000";

#[derive(Parser)]
#[command(name = "trackgate")]
#[command(about = "Inspect and exercise the analytics event pipeline")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file to the XDG state directory)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and offline queue status
    Status,

    /// Run recorded events through the pipeline
    Replay {
        /// JSON lines: {"name": .., "payload": {..}} or {"page_view": "/path"}
        file: PathBuf,

        /// Replay without analytics consent
        #[arg(long)]
        no_analytics: bool,

        /// Grant marketing consent
        #[arg(long)]
        marketing: bool,

        /// Buffer accepted events into batches
        #[arg(long)]
        batch: bool,

        /// Fail every event delivery, so events end up in the offline queue
        #[arg(long)]
        offline: bool,
    },

    /// Inspect or clear the durable offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued events
    Show,
    /// Remove every queued event
    Clear,
}

/// One line of a replay file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplayLine {
    PageView {
        page_view: String,
    },
    Event {
        name: String,
        #[serde(default)]
        payload: Option<Value>,
    },
}

/// Data layer that refuses events the way a page without network would
struct OfflineLayer {
    layer: Arc<DataLayer>,
}

impl DispatchHandle for OfflineLayer {
    fn dispatch(&self, call: CollectorCall) -> trackgate_core::Result<()> {
        if matches!(call, CollectorCall::Event { .. }) {
            return Err(trackgate_core::Error::Network("offline replay".to_string()));
        }
        self.layer.dispatch(call)
    }

    fn clear_buffer(&self) {
        self.layer.clear_buffer();
    }
}

/// Returns $HOME or panics
fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .expect("HOME environment variable not set")
}

/// Sets XDG environment variables to ensure the core library uses XDG paths
fn ensure_xdg_env() {
    let home = home_dir();

    if std::env::var("XDG_DATA_HOME").is_err() {
        std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
    }

    if std::env::var("XDG_STATE_HOME").is_err() {
        std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
    }

    if std::env::var("XDG_CONFIG_HOME").is_err() {
        std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive for the whole run
    let _log_guard = if args.verbose {
        Some(
            trackgate_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Replay {
            file,
            no_analytics,
            marketing,
            batch,
            offline,
        } => {
            let consent = ConsentState {
                necessary: true,
                analytics: !no_analytics,
                marketing,
            };
            cmd_replay(config, &file, consent, batch, offline).await
        }
        Command::Queue { action } => match action {
            QueueAction::Show => cmd_queue_show(),
            QueueAction::Clear => cmd_queue_clear(),
        },
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("trackgate Configuration");
    println!("=======================");
    println!();

    let collector = &config.collector;
    match collector.measurement_id.as_deref() {
        Some(id) => {
            let validity = match validate_measurement_id(id) {
                Ok(()) => "valid",
                Err(_) => "INVALID",
            };
            println!("Measurement ID:  {} ({})", id, validity);
            println!("Loader:          {}", loader_src(&collector.loader_url, id));
        }
        None => {
            println!("Measurement ID:  <not set>");
            println!("Loader:          {}", collector.loader_url);
        }
    }
    println!("Production:      {}", collector.production);
    println!("Load Timeout:    {}ms", collector.load_timeout_ms);
    println!(
        "Rate Limit:      {} events / {}ms",
        config.rate_limit.max_events, config.rate_limit.window_ms
    );
    println!("Dedup Window:    {}ms", config.dedup.window_ms);
    println!(
        "Batching:        {} (size {}, timeout {}ms)",
        if config.batching.enabled { "on" } else { "off" },
        config.batching.batch_size,
        config.batching.timeout_ms
    );
    println!(
        "Retry:           {} attempts, {}ms initial, {}ms max, x{}",
        config.retry.max_attempts,
        config.retry.initial_delay_ms,
        config.retry.max_delay_ms,
        config.retry.backoff_multiplier
    );

    println!();
    let storage_path = Config::storage_path();
    if storage_path.exists() {
        let store = open_store(&storage_path)?;
        let queued = read_persisted(&store, &Log::default());
        println!("Queued Events:   {}", queued.len());
    } else {
        println!("Queued Events:   0 (no storage at {})", storage_path.display());
    }

    Ok(())
}

async fn cmd_replay(
    mut config: Config,
    file: &Path,
    consent: ConsentState,
    batch: bool,
    offline: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    tracing::info!(file = %file.display(), batch, offline, "Replaying events");

    config.batching.enabled = batch;
    let measurement_id = config
        .collector
        .measurement_id
        .clone()
        .unwrap_or_else(|| PLACEHOLDER_MEASUREMENT_ID.to_string());

    // Time for background retries to run out before the queue is read back
    let retry_budget: Duration = RetryPolicy::from(config.retry).schedule().iter().sum();

    let layer = Arc::new(DataLayer::new());
    let dispatch: Arc<dyn DispatchHandle> = if offline {
        Arc::new(OfflineLayer {
            layer: layer.clone(),
        })
    } else {
        layer.clone()
    };
    let host = HostBindings {
        document: Arc::new(MemoryDocument::default()),
        cookies: Arc::new(MemoryCookieJar::new("localhost", "/")),
        dispatch,
        location: Location::new("localhost", "/"),
    };

    let persist = config.queue.persist;
    let mut builder = Tracker::builder(config)
        .context(RuntimeContext::with_host(host).measurement_id(measurement_id))
        .consent(Arc::new(SharedConsent::with_state(consent)));
    if persist {
        let store = open_store(&Config::storage_path())?;
        builder = builder.store(Arc::new(store));
    }
    let tracker = builder.build().context("failed to build tracker")?;

    tracker.init_tracking();
    println!("Collector: {}", tracker.collector_state().as_str());
    println!();

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: ReplayLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("{:>4}  <skipped: {}>", line_no, e);
                continue;
            }
        };

        let (label, decision) = match parsed {
            ReplayLine::PageView { page_view } => {
                let decision = tracker.track_page_view(&page_view);
                (format!("page_view {}", page_view), decision)
            }
            ReplayLine::Event { name, payload } => {
                let decision = tracker.track(&name, payload.as_ref());
                (name, decision)
            }
        };

        match decision {
            Decision::Accept(event) => println!("{:>4}  accepted  {}", line_no, event.name),
            Decision::Reject(reason) => println!("{:>4}  rejected  {} ({})", line_no, label, reason),
        }
    }

    tracker.flush();
    if offline {
        tokio::time::sleep(retry_budget + Duration::from_millis(50)).await;
    }

    println!();
    print_stats(&tracker.stats());
    println!("Data layer calls: {}", layer.len());

    tracker.dispose();
    Ok(())
}

fn print_stats(stats: &TrackingStats) {
    println!("Accepted:        {}", stats.accepted);
    println!("Rejected:        {}", stats.total_rejected());

    let mut reasons: Vec<_> = stats.rejected.iter().filter(|(_, n)| **n > 0).collect();
    reasons.sort_by_key(|(reason, _)| reason.as_str());
    for (reason, count) in reasons {
        println!("  {:<14} {}", reason.as_str(), count);
    }

    println!("Dispatched:      {}", stats.dispatched);
    println!("Queued:          {}", stats.queued);
    println!("Dropped:         {}", stats.dropped);
    println!("Batches:         {}", stats.batches_flushed);
}

fn cmd_queue_show() -> Result<()> {
    let storage_path = Config::storage_path();
    if !storage_path.exists() {
        println!("Offline queue is empty");
        return Ok(());
    }

    let store = open_store(&storage_path)?;
    let queued = read_persisted(&store, &Log::default());
    if queued.is_empty() {
        println!("Offline queue is empty");
        return Ok(());
    }

    println!("{} queued event(s):", queued.len());
    println!();
    for entry in &queued {
        let enqueued = Utc
            .timestamp_millis_opt(entry.enqueued_at as i64)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| entry.enqueued_at.to_string());
        let payload = serde_json::to_string(&entry.event.params())?;
        println!(
            "  {}  {:<24} retries={}  {}",
            enqueued, entry.event.name, entry.retry_count, payload
        );
    }

    Ok(())
}

fn cmd_queue_clear() -> Result<()> {
    let storage_path = Config::storage_path();
    if !storage_path.exists() {
        println!("Offline queue is empty");
        return Ok(());
    }

    let store = open_store(&storage_path)?;
    let count = read_persisted(&store, &Log::default()).len();
    store
        .remove(QUEUE_STORAGE_KEY)
        .context("failed to clear offline queue")?;
    println!("Cleared {} queued event(s)", count);

    Ok(())
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    SqliteStore::open(path)
        .with_context(|| format!("failed to open storage at {}", path.display()))
}
