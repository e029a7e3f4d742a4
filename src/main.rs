//! Loki Shipper - ships stdin lines to a Loki server
//!
//! Every line read from standard input becomes a log entry carrying the
//! labels from `LOKI_SHIPPER_LABELS`. Entries are batched per stream and
//! pushed in the background.
//!
//! ## Features
//!
//! - Per-stream batching with size and time based flushing
//! - Gzip compression, retry with exponential backoff
//! - Configurable backpressure when the server falls behind
//! - Graceful shutdown with drain on EOF or Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from `LOKI_SHIPPER_*` environment variables, see
//! [`loki_shipper::config::Config`]. Notable ones:
//!
//! - `LOKI_SHIPPER_URL`: Loki base URL (default: http://localhost:3100)
//! - `LOKI_SHIPPER_LABELS`: labels for every line, `k=v,k=v` (default: job=loki-shipper)
//! - `LOKI_SHIPPER_BACKPRESSURE`: `block`, `drop_new` or `error` (default: block)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loki_shipper::config::Config;
use loki_shipper::dispatcher::Dispatcher;
use loki_shipper::entry::Entry;

/// How long shutdown waits for in-flight deliveries
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Loki Shipper...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                push_url = %config.push_url(),
                backpressure = %config.backpressure,
                workers = config.workers,
                max_batch_entries = config.batch.max_batch_entries,
                max_batch_wait_ms = config.batch.max_batch_wait.as_millis() as u64,
                compression = config.compression,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let dispatcher = match Dispatcher::from_config(&config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, "Failed to create dispatcher");
            std::process::exit(1);
        }
    };
    if let Err(e) = dispatcher.start() {
        error!(error = %e, "Failed to start dispatcher");
        std::process::exit(1);
    }

    info!("Reading lines from stdin. Press Ctrl+C to stop.");
    tokio::select! {
        lines = ship_stdin(&dispatcher, &config.static_labels) => {
            info!(lines, "Reached end of input, stopping...");
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    let report = dispatcher.shutdown(SHUTDOWN_TIMEOUT).await;
    if !report.completed {
        warn!(
            "Shutdown timed out after {:?}, some payloads may not have been delivered",
            SHUTDOWN_TIMEOUT
        );
    }

    let metrics = &report.metrics;
    info!(
        entries_submitted = metrics.entries_submitted,
        entries_delivered = metrics.entries_delivered,
        entries_rejected = metrics.entries_rejected,
        entries_dropped = metrics.entries_dropped,
        payloads_delivered = metrics.payloads_delivered,
        payloads_retried = metrics.payloads_retried,
        payloads_exhausted = metrics.payloads_exhausted,
        "Loki Shipper stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Enqueue every stdin line until EOF. Returns the number of lines read.
async fn ship_stdin(dispatcher: &Dispatcher, labels: &[(String, String)]) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count: u64 = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                count += 1;
                let entry = Entry::new(line, labels.iter().cloned());
                // Rejections are logged and counted by the dispatcher.
                if dispatcher.enqueue(entry).await.is_err() && dispatcher.is_closed() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read from stdin");
                break;
            }
        }
    }
    count
}
