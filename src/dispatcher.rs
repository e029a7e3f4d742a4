//! The delivery engine: accepts entries, flushes batches and runs them
//! through encoding and delivery on a pool of workers.
//!
//! ```text
//!   enqueue ──> Batcher ──(flush loop: size / time / pressure)──> shard 0 ──> worker 0 ──> Encoder ──> Sender
//!                                                          └──> shard N ──> worker N ──> Encoder ──> Sender
//! ```
//!
//! A single flush loop owns every flush decision. It wakes on a timer tick
//! or when a submission reports a ready stream or a full buffer, takes ready
//! batches out of the batcher and routes each stream to a worker chosen by
//! hashing its key. Routing a key to the same worker every time keeps each
//! stream's payloads in submission order.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batcher::{
    Batch, BatchConfig, Batcher, RejectReason, Rejected, StreamBuffer, StreamOccupancy,
    SubmitStatus,
};
use crate::client::{ClientError, HttpPushClient};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::encoder::Encoder;
use crate::entry::{Entry, StreamKey};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::sender::{DeliveryState, RetryConfig, Sender, Transport};

/// Default longest wait for buffer space in `block` mode.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of flush workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default number of batches queued per worker.
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 16;

/// What `enqueue` does when the buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Wait up to `block_timeout` for space, then reject
    #[default]
    Block,

    /// Reject immediately and count the entry as dropped
    DropNew,

    /// Reject immediately and leave the decision to the caller
    Error,
}

impl FromStr for BackpressureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(BackpressureMode::Block),
            "drop_new" | "drop-new" | "drop" => Ok(BackpressureMode::DropNew),
            "error" => Ok(BackpressureMode::Error),
            other => Err(format!(
                "unknown backpressure mode '{}' (expected block, drop_new or error)",
                other
            )),
        }
    }
}

impl fmt::Display for BackpressureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackpressureMode::Block => "block",
            BackpressureMode::DropNew => "drop_new",
            BackpressureMode::Error => "error",
        };
        f.write_str(name)
    }
}

/// Settings for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub backpressure: BackpressureMode,

    /// Longest time `enqueue` waits for space in `block` mode
    pub block_timeout: Duration,

    /// Gzip payloads when it makes them smaller
    pub compression: bool,

    pub workers: usize,

    /// Batches queued per worker before the flush loop waits
    pub worker_queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            backpressure: BackpressureMode::default(),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            compression: true,
            workers: DEFAULT_WORKERS,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
        }
    }
}

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("dispatcher is already running")]
    AlreadyStarted,

    #[error("dispatcher has been shut down")]
    Closed,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Why a batch was lost after it left the batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Encoding,
    Fatal,
    Exhausted,
}

/// Passed to the error callback for every lost batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Absent when the batch never became a payload
    pub payload_id: Option<Uuid>,
    pub kind: FailureKind,
    pub entries: usize,

    /// Encoded payload size, or line bytes for an [`FailureKind::Encoding`]
    /// failure
    pub bytes: usize,
    pub reason: String,
}

/// Callback notified of delivery failures.
pub type ErrorCallback = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Entries still buffered when shutdown began
    pub pending_entries: usize,

    /// Whether all work finished within the timeout
    pub completed: bool,

    pub elapsed: Duration,

    pub metrics: MetricsSnapshot,
}

/// Builder for a [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    on_failure: Option<ErrorCallback>,
}

impl DispatcherBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DeliveryFailure) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Dispatcher {
        let workers = self.config.workers.max(1);
        let batcher = Batcher::new(self.config.batch.clone(), self.clock.now());
        let pipeline = Pipeline {
            encoder: Encoder::new(self.config.compression),
            sender: Sender::new(self.transport, self.clock.clone(), self.config.retry.clone()),
            on_failure: self.on_failure,
        };

        Dispatcher {
            inner: Arc::new(Inner {
                config: DispatcherConfig {
                    workers,
                    ..self.config
                },
                batcher: Mutex::new(batcher),
                metrics: Metrics::new(),
                flush_signal: Notify::new(),
                space_freed: Notify::new(),
                clock: self.clock,
                pipeline,
                state: Mutex::new(RunState::Idle),
                shutdown_done: watch::channel(None).0,
            }),
        }
    }
}

/// Accepts log entries and delivers them in the background.
///
/// Cloning is cheap; every clone feeds the same batcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    batcher: Mutex<Batcher>,
    metrics: Metrics,

    /// Wakes the flush loop early
    flush_signal: Notify,

    /// Wakes `enqueue` callers waiting for buffer space
    space_freed: Notify,

    clock: Arc<dyn Clock>,
    pipeline: Pipeline,
    state: Mutex<RunState>,

    /// Outcome of the first `shutdown`, once it has finished
    shutdown_done: watch::Sender<Option<bool>>,
}

enum RunState {
    Idle,
    Running(Tasks),
    Stopped,
}

struct Tasks {
    cancel: CancellationToken,
    flush_loop: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Encode and deliver, then account for the result.
struct Pipeline {
    encoder: Encoder,
    sender: Sender,
    on_failure: Option<ErrorCallback>,
}

impl Dispatcher {
    pub fn builder(config: DispatcherConfig, transport: Arc<dyn Transport>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            transport,
            clock: Arc::new(SystemClock),
            on_failure: None,
        }
    }

    pub fn new(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Self {
        Self::builder(config, transport).build()
    }

    /// Build a dispatcher pushing over HTTP as described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, DispatcherError> {
        let client = HttpPushClient::new(config)?;
        Ok(Self::new(config.dispatcher_config(), Arc::new(client)))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Spawn the flush loop and workers on the current tokio runtime.
    pub fn start(&self) -> Result<(), DispatcherError> {
        let mut state = self.inner.lock_state();
        match *state {
            RunState::Idle => {}
            RunState::Running(_) => return Err(DispatcherError::AlreadyStarted),
            RunState::Stopped => return Err(DispatcherError::Closed),
        }

        self.inner.lock_batcher().reset_timer(self.inner.clock.now());

        let cancel = CancellationToken::new();
        let mut shards = Vec::with_capacity(self.inner.config.workers);
        let mut workers = Vec::with_capacity(self.inner.config.workers);
        for id in 0..self.inner.config.workers {
            let (tx, rx) = mpsc::channel(self.inner.config.worker_queue_capacity.max(1));
            shards.push(tx);
            workers.push(tokio::spawn(run_worker(id, self.inner.clone(), rx)));
        }
        let flush_loop = tokio::spawn(run_flush_loop(self.inner.clone(), shards, cancel.clone()));

        info!(
            workers = self.inner.config.workers,
            backpressure = %self.inner.config.backpressure,
            max_batch_wait_ms = self.inner.config.batch.max_batch_wait.as_millis() as u64,
            "Dispatcher started"
        );

        *state = RunState::Running(Tasks {
            cancel,
            flush_loop,
            workers,
        });
        Ok(())
    }

    /// Submit an entry without waiting.
    ///
    /// In `block` mode a full buffer is reported as `BufferFull` just like
    /// `error` mode; only [`enqueue`](Self::enqueue) waits.
    pub fn try_enqueue(&self, entry: Entry) -> Result<(), Rejected> {
        self.inner
            .submit(entry)
            .map_err(|rejected| self.inner.reject(rejected))
    }

    /// Submit an entry, applying the configured backpressure mode.
    pub async fn enqueue(&self, entry: Entry) -> Result<(), Rejected> {
        if self.inner.config.backpressure != BackpressureMode::Block {
            return self.try_enqueue(entry);
        }

        let deadline = Instant::now() + self.inner.config.block_timeout;
        let mut entry = entry;
        loop {
            // Registered before submitting so a flush in between is not missed.
            let space_freed = self.inner.space_freed.notified();
            tokio::pin!(space_freed);
            space_freed.as_mut().enable();

            match self.inner.submit(entry) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    reason: RejectReason::BufferFull,
                    entry: refused,
                }) => {
                    if tokio::time::timeout_at(deadline, space_freed).await.is_err() {
                        warn!(
                            timeout_ms = self.inner.config.block_timeout.as_millis() as u64,
                            "Timed out waiting for buffer space"
                        );
                        return Err(self.inner.reject(Rejected {
                            reason: RejectReason::BufferFull,
                            entry: refused,
                        }));
                    }
                    entry = refused;
                }
                Err(rejected) => return Err(self.inner.reject(rejected)),
            }
        }
    }

    /// Stop accepting entries, flush everything buffered and wait up to
    /// `timeout` for delivery to finish.
    ///
    /// Deliveries still running when the timeout expires keep going in the
    /// background; the report says whether everything completed. Later or
    /// concurrent calls wait, up to their own `timeout`, for the first one to
    /// finish and report its outcome.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let pending_entries = {
            let mut batcher = self.inner.lock_batcher();
            batcher.close();
            batcher.buffered_entries()
        };
        // Blocked callers re-check and observe the closed batcher.
        self.inner.space_freed.notify_waiters();

        let state = std::mem::replace(&mut *self.inner.lock_state(), RunState::Stopped);
        info!(pending_entries, "Dispatcher shutting down");

        let owner = !matches!(state, RunState::Stopped);
        let completed = match state {
            RunState::Running(tasks) => {
                tasks.cancel.cancel();
                let finished = async move {
                    if let Err(e) = tasks.flush_loop.await {
                        error!(error = %e, "Flush loop terminated abnormally");
                    }
                    for worker in tasks.workers {
                        if let Err(e) = worker.await {
                            error!(error = %e, "Worker terminated abnormally");
                        }
                    }
                };
                tokio::time::timeout(timeout, finished).await.is_ok()
            }
            RunState::Idle => {
                let batch = self.inner.lock_batcher().drain(self.inner.clock.now());
                if batch.is_empty() {
                    true
                } else {
                    tokio::time::timeout(timeout, self.inner.process(batch))
                        .await
                        .is_ok()
                }
            }
            RunState::Stopped => {
                let mut done = self.inner.shutdown_done.subscribe();
                let outcome = async {
                    let outcome = done.wait_for(Option::is_some).await.ok()?;
                    *outcome
                };
                tokio::time::timeout(timeout, outcome)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(false)
            }
        };
        if owner {
            self.inner.shutdown_done.send_replace(Some(completed));
        }

        let report = ShutdownReport {
            pending_entries,
            completed,
            elapsed: started.elapsed(),
            metrics: self.metrics(),
        };
        if completed {
            info!(
                elapsed_ms = report.elapsed.as_millis() as u64,
                delivered = report.metrics.entries_delivered,
                dropped = report.metrics.entries_dropped,
                "Dispatcher stopped"
            );
        } else {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timed out with deliveries still in flight"
            );
        }
        report
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let batcher = self.inner.lock_batcher();
        self.inner.metrics.snapshot(&batcher)
    }

    pub fn stream_occupancy(&self) -> Vec<StreamOccupancy> {
        self.inner.lock_batcher().occupancy()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_batcher().is_closed()
    }
}

impl Inner {
    fn lock_batcher(&self) -> MutexGuard<'_, Batcher> {
        self.batcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, entry: Entry) -> Result<(), Rejected> {
        let result = self.lock_batcher().submit(entry, self.clock.now());
        match result {
            Ok(status) => {
                self.metrics.record_submitted();
                if status == SubmitStatus::StreamReady {
                    self.flush_signal.notify_one();
                }
                Ok(())
            }
            Err(rejected) => {
                if rejected.reason == RejectReason::BufferFull {
                    self.flush_signal.notify_one();
                }
                Err(rejected)
            }
        }
    }

    /// Account for a refused entry and hand it back.
    fn reject(&self, rejected: Rejected) -> Rejected {
        let dropped = rejected.reason == RejectReason::BufferFull
            && self.config.backpressure == BackpressureMode::DropNew;
        self.metrics.record_rejected(dropped, rejected.entry.size());

        match &rejected.reason {
            RejectReason::BufferFull => debug!(dropped, "Entry rejected: buffer full"),
            reason => warn!(
                stream = %rejected.entry.stream_key(),
                reason = %reason,
                "Entry rejected"
            ),
        }
        rejected
    }

    /// Take every batch that is due and hand it to the workers.
    async fn dispatch_ready(&self, shards: &[mpsc::Sender<Batch>]) {
        loop {
            let batch = self.lock_batcher().take_ready(self.clock.now());
            let Some(batch) = batch else { break };
            self.space_freed.notify_waiters();
            self.route(batch, shards).await;
        }
    }

    async fn route(&self, batch: Batch, shards: &[mpsc::Sender<Batch>]) {
        let trigger = batch.trigger();
        let mut split: Vec<Vec<StreamBuffer>> = (0..shards.len()).map(|_| Vec::new()).collect();
        for stream in batch.into_streams() {
            split[shard_for(stream.key(), shards.len())].push(stream);
        }

        for (shard, streams) in split.into_iter().enumerate() {
            if streams.is_empty() {
                continue;
            }
            let batch = Batch::new(trigger, streams);
            if let Err(mpsc::error::SendError(batch)) = shards[shard].send(batch).await {
                // Workers only stop once every sender is gone.
                error!(shard, "Worker queue closed, delivering inline");
                self.process(batch).await;
            }
        }
    }

    async fn process(&self, batch: Batch) {
        let entries = batch.entry_count();
        let bytes = batch.byte_size();
        let trigger = batch.trigger();

        let payload = match self.pipeline.encoder.encode(batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, entries, "Failed to encode batch, dropping it");
                self.metrics.record_encoding_failure(entries, bytes);
                self.notify_failure(DeliveryFailure {
                    payload_id: None,
                    kind: FailureKind::Encoding,
                    entries,
                    bytes,
                    reason: e.to_string(),
                });
                return;
            }
        };

        debug!(
            payload_id = %payload.id(),
            trigger = ?trigger,
            streams = payload.stream_count(),
            entries,
            encoded_bytes = payload.encoded_len(),
            uncompressed_bytes = payload.uncompressed_len(),
            "Encoded batch"
        );

        let report = self.pipeline.sender.deliver(payload).await;
        self.metrics.record_delivery(&report);

        let failure = match &report.state {
            DeliveryState::Failed { reason } => Some((FailureKind::Fatal, reason.clone())),
            DeliveryState::Exhausted { reason } => Some((FailureKind::Exhausted, reason.clone())),
            _ => None,
        };
        if let Some((kind, reason)) = failure {
            self.notify_failure(DeliveryFailure {
                payload_id: Some(report.payload_id),
                kind,
                entries: report.entries,
                bytes: report.encoded_bytes,
                reason,
            });
        }
    }

    fn notify_failure(&self, failure: DeliveryFailure) {
        if let Some(callback) = &self.pipeline.on_failure {
            callback(&failure);
        }
    }
}

fn shard_for(key: &StreamKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn run_flush_loop(
    inner: Arc<Inner>,
    shards: Vec<mpsc::Sender<Batch>>,
    cancel: CancellationToken,
) {
    let period = (inner.config.batch.max_batch_wait / 4).max(Duration::from_millis(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = inner.flush_signal.notified() => {}
            _ = ticker.tick() => {}
        }
        inner.dispatch_ready(&shards).await;
    }

    let batch = inner.lock_batcher().drain(inner.clock.now());
    if !batch.is_empty() {
        info!(
            streams = batch.streams().len(),
            entries = batch.entry_count(),
            "Draining remaining entries"
        );
        inner.route(batch, &shards).await;
    }
    debug!("Flush loop stopped");
    // Dropping the shard senders lets the workers finish their queues and exit.
}

async fn run_worker(id: usize, inner: Arc<Inner>, mut rx: mpsc::Receiver<Batch>) {
    while let Some(batch) = rx.recv().await {
        inner.process(batch).await;
    }
    debug!(worker = id, "Worker stopped");
}
