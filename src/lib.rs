//! Loki Shipper Library
//!
//! This library ships labeled log lines to a Loki server without blocking
//! the caller on network I/O:
//!
//! - **entry**: Log entries, label normalization and stream keys
//! - **batcher**: Per-stream buffering with size, time and pressure flush triggers
//! - **encoder**: Push payload serialization with optional gzip
//! - **sender**: Retry/backoff state machine over a pluggable transport
//! - **client**: HTTP push transport with connection pooling
//! - **dispatcher**: Flush loop, worker pool, backpressure and graceful shutdown
//! - **metrics**: Delivery counters and buffer occupancy
//! - **query**: Client for the query endpoints
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use loki_shipper::config::Config;
//! use loki_shipper::dispatcher::Dispatcher;
//! use loki_shipper::entry::Entry;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Build and start the delivery engine
//!     let dispatcher = Dispatcher::from_config(&config).expect("Failed to create dispatcher");
//!     dispatcher.start().expect("Failed to start dispatcher");
//!
//!     // Submit entries; delivery happens in the background
//!     dispatcher
//!         .enqueue(Entry::new("user logged in", [("app", "api"), ("env", "prod")]))
//!         .await
//!         .ok();
//!
//!     // Flush everything that was accepted
//!     let report = dispatcher.shutdown(Duration::from_secs(10)).await;
//!     println!("delivered {} entries", report.metrics.entries_delivered);
//! }
//! ```

// Module declarations
pub mod batcher;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod entry;
pub mod metrics;
pub mod query;
pub mod sender;

// Re-export commonly used types at crate root for convenience
pub use batcher::{BatchConfig, RejectReason, Rejected};
pub use client::{ClientError, HttpPushClient};
pub use config::{Config, ConfigError, Credentials};
pub use dispatcher::{
    BackpressureMode, DeliveryFailure, Dispatcher, DispatcherConfig, DispatcherError,
    FailureKind, ShutdownReport,
};
pub use entry::{Entry, LabelError, StreamKey};
pub use metrics::MetricsSnapshot;
pub use query::{Direction, QueryClient, QueryError, QueryResponse, QueryResult, ResultType};
pub use sender::{RetryConfig, Transport};
