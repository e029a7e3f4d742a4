//! Per-stream batching of log entries.
//!
//! The [`Batcher`] groups entries by [`StreamKey`] into [`StreamBuffer`]s and
//! decides when buffered data is ready to leave:
//!
//! - **size**: a single stream reached `max_batch_bytes` or `max_batch_entries`
//! - **time**: `max_batch_wait` elapsed since the last full flush
//! - **pressure**: a submission was refused because the memory charged to
//!   buffered data hit `max_buffered_bytes`
//! - **drain**: everything, unconditionally (shutdown)
//!
//! When several triggers apply at once, size wins: [`Batcher::take_ready`]
//! first hands out only the streams over their threshold, and a subsequent
//! call collects the remainder for the time or pressure flush.
//!
//! The ceiling counts more than line bytes. Every entry is charged its line
//! plus [`ENTRY_OVERHEAD_BYTES`], and every open stream is charged
//! [`stream_charge`] for its labels and key, so entries with empty lines still
//! fill the buffer.
//!
//! The batcher is synchronous and takes the current instant as an argument,
//! so the dispatcher owns all scheduling and every decision here is testable
//! without timers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::entry::{Entry, LabelError, LabelPolicy, LabelSet, StreamKey};

/// Default per-stream flush threshold in bytes (1 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Default per-stream flush threshold in entries.
pub const DEFAULT_MAX_BATCH_ENTRIES: usize = 1_000;

/// Default upper bound on how long an entry waits before a flush.
pub const DEFAULT_MAX_BATCH_WAIT: Duration = Duration::from_secs(1);

/// Default ceiling on bytes buffered across all streams (64 MiB).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024 * 1024;

/// Default maximum size of a single log line (256 KiB, Loki's default).
pub const DEFAULT_MAX_LINE_BYTES: usize = 256 * 1024;

/// Bytes charged against `max_buffered_bytes` for each buffered entry on top
/// of its line.
pub const ENTRY_OVERHEAD_BYTES: usize = std::mem::size_of::<BufferedLine>();

/// Bytes charged for each open stream buffer on top of its label bytes.
pub const STREAM_OVERHEAD_BYTES: usize = std::mem::size_of::<StreamBuffer>();

/// Bytes charged against the ceiling for an entry with a `line_len` byte line.
pub fn entry_charge(line_len: usize) -> usize {
    line_len + ENTRY_OVERHEAD_BYTES
}

/// Bytes charged against the ceiling when a stream buffer for `labels` opens.
///
/// The stream key is held twice: as the map key and inside the buffer.
pub fn stream_charge(labels: &LabelSet) -> usize {
    let label_bytes: usize = labels.iter().map(|(name, value)| name.len() + value.len()).sum();
    STREAM_OVERHEAD_BYTES + label_bytes + 2 * labels.key().as_str().len()
}

/// Thresholds governing when buffered entries are flushed or refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush a stream once its buffered lines reach this many bytes
    pub max_batch_bytes: usize,

    /// Flush a stream once it holds this many entries
    pub max_batch_entries: usize,

    /// Flush everything once this long has passed since the last full flush
    pub max_batch_wait: Duration,

    /// Refuse new entries once the memory charged to buffered data would
    /// exceed this many bytes
    pub max_buffered_bytes: usize,

    /// Refuse any single line larger than this
    pub max_line_bytes: usize,

    /// Label normalization rules
    pub labels: LabelPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_entries: DEFAULT_MAX_BATCH_ENTRIES,
            max_batch_wait: DEFAULT_MAX_BATCH_WAIT,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            labels: LabelPolicy::default(),
        }
    }
}

/// Why an entry was refused at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// Memory charged to buffered data would exceed `max_buffered_bytes`
    #[error("buffer is full")]
    BufferFull,

    /// The line alone exceeds `max_line_bytes`
    #[error("entry of {size} bytes exceeds the {max} byte line limit")]
    EntryTooLarge { size: usize, max: usize },

    #[error("invalid labels: {0}")]
    InvalidLabels(#[from] LabelError),

    /// Shutdown has begun and no more entries are admitted
    #[error("shipper is shutting down")]
    Closed,
}

/// A refused submission, handing the entry back to the caller.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Rejected {
    pub reason: RejectReason,
    pub entry: Entry,
}

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The entry was buffered and no threshold was crossed
    Buffered,

    /// The entry's stream crossed a size threshold and should be flushed
    StreamReady,
}

/// What caused a batch to be taken out of the batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Time,
    Pressure,
    Drain,
}

/// One buffered log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Entries sharing one stream key, in submission order.
#[derive(Debug)]
pub struct StreamBuffer {
    key: StreamKey,
    labels: LabelSet,
    entries: Vec<BufferedLine>,
    byte_size: usize,
    charged: usize,
    created_at: Instant,
}

impl StreamBuffer {
    fn new(key: StreamKey, labels: LabelSet, created_at: Instant) -> Self {
        Self {
            key,
            labels,
            entries: Vec::new(),
            byte_size: 0,
            charged: 0,
            created_at,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn entries(&self) -> &[BufferedLine] {
        &self.entries
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Bytes this buffer holds against `max_buffered_bytes`.
    pub fn charged_bytes(&self) -> usize {
        self.charged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Streams taken out of the batcher by a single flush, ordered by key.
#[derive(Debug)]
pub struct Batch {
    trigger: FlushTrigger,
    streams: Vec<StreamBuffer>,
}

impl Batch {
    pub(crate) fn new(trigger: FlushTrigger, streams: Vec<StreamBuffer>) -> Self {
        Self { trigger, streams }
    }

    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    pub fn streams(&self) -> &[StreamBuffer] {
        &self.streams
    }

    pub(crate) fn into_streams(self) -> Vec<StreamBuffer> {
        self.streams
    }

    /// Number of entries across all streams.
    pub fn entry_count(&self) -> usize {
        self.streams.iter().map(StreamBuffer::len).sum()
    }

    /// Buffered line bytes across all streams.
    pub fn byte_size(&self) -> usize {
        self.streams.iter().map(StreamBuffer::byte_size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Occupancy of a single stream buffer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StreamOccupancy {
    pub key: StreamKey,
    pub entries: usize,
    pub bytes: usize,
}

/// Statistics about batcher decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Entries submitted with a timestamp older than their stream's last entry
    pub out_of_order: u64,

    /// Flushes triggered by a stream crossing a size threshold
    pub size_flushes: u64,

    /// Flushes triggered by `max_batch_wait`
    pub time_flushes: u64,

    /// Flushes triggered by aggregate buffer pressure
    pub pressure_flushes: u64,
}

/// Groups entries into per-stream buffers and decides when to flush.
///
/// Entries within a stream must be submitted in non-decreasing timestamp
/// order; the batcher preserves submission order and does not re-sort.
/// Violations are counted in [`BatcherStats::out_of_order`] and logged.
#[derive(Debug)]
pub struct Batcher {
    config: BatchConfig,
    streams: BTreeMap<StreamKey, StreamBuffer>,
    buffered_bytes: usize,
    charged_bytes: usize,
    buffered_entries: usize,
    last_flush: Instant,
    under_pressure: bool,
    closed: bool,
    stats: BatcherStats,
}

impl Batcher {
    pub fn new(config: BatchConfig, now: Instant) -> Self {
        Self {
            config,
            streams: BTreeMap::new(),
            buffered_bytes: 0,
            charged_bytes: 0,
            buffered_entries: 0,
            last_flush: now,
            under_pressure: false,
            closed: false,
            stats: BatcherStats::default(),
        }
    }

    /// Add an entry to its stream buffer.
    ///
    /// Returns [`SubmitStatus::StreamReady`] when the entry pushed its stream
    /// over a size threshold. On refusal the entry is handed back.
    pub fn submit(&mut self, entry: Entry, now: Instant) -> Result<SubmitStatus, Rejected> {
        if self.closed {
            return Err(Rejected {
                reason: RejectReason::Closed,
                entry,
            });
        }

        let size = entry.size();
        if size > self.config.max_line_bytes {
            return Err(Rejected {
                reason: RejectReason::EntryTooLarge {
                    size,
                    max: self.config.max_line_bytes,
                },
                entry,
            });
        }

        let labels = match LabelSet::normalize(entry.labels().to_vec(), &self.config.labels) {
            Ok(labels) => labels,
            Err(e) => {
                return Err(Rejected {
                    reason: RejectReason::InvalidLabels(e),
                    entry,
                })
            }
        };

        let key = labels.key();
        let mut charge = entry_charge(size);
        if !self.streams.contains_key(&key) {
            charge += stream_charge(&labels);
        }

        // A lone entry is always admitted so an empty buffer can make progress.
        if self.charged_bytes > 0 && self.charged_bytes + charge > self.config.max_buffered_bytes
        {
            self.under_pressure = true;
            return Err(Rejected {
                reason: RejectReason::BufferFull,
                entry,
            });
        }

        let (timestamp, line, _) = entry.into_parts();
        let buffer = self
            .streams
            .entry(key.clone())
            .or_insert_with(|| StreamBuffer::new(key, labels, now));

        if let Some(last) = buffer.entries.last() {
            if timestamp < last.timestamp {
                self.stats.out_of_order += 1;
                warn!(
                    stream = %buffer.key,
                    "Entry timestamp is older than the previous entry in its stream"
                );
            }
        }

        buffer.entries.push(BufferedLine { timestamp, line });
        buffer.byte_size += size;
        buffer.charged += charge;
        self.buffered_bytes += size;
        self.charged_bytes += charge;
        self.buffered_entries += 1;

        if Self::is_ready(&self.config, buffer) {
            Ok(SubmitStatus::StreamReady)
        } else {
            Ok(SubmitStatus::Buffered)
        }
    }

    /// Take whatever is due for flushing, if anything.
    ///
    /// Streams over a size threshold are returned on their own first. Only
    /// when none are left does the time or pressure trigger hand out every
    /// remaining stream.
    pub fn take_ready(&mut self, now: Instant) -> Option<Batch> {
        let ready: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, buffer)| Self::is_ready(&self.config, buffer))
            .map(|(key, _)| key.clone())
            .collect();

        if !ready.is_empty() {
            let streams: Vec<StreamBuffer> = ready
                .iter()
                .filter_map(|key| self.streams.remove(key))
                .collect();
            for buffer in &streams {
                self.buffered_bytes -= buffer.byte_size;
                self.charged_bytes -= buffer.charged;
                self.buffered_entries -= buffer.len();
            }
            self.stats.size_flushes += 1;
            debug!(
                streams = streams.len(),
                "Flushing streams: size threshold reached"
            );
            return Some(Batch::new(FlushTrigger::Size, streams));
        }

        if self.streams.is_empty() {
            self.under_pressure = false;
            return None;
        }

        if now.saturating_duration_since(self.last_flush) >= self.config.max_batch_wait {
            self.stats.time_flushes += 1;
            debug!(
                streams = self.streams.len(),
                entries = self.buffered_entries,
                "Flushing streams: batch wait elapsed"
            );
            return Some(self.take_all(FlushTrigger::Time, now));
        }

        if self.under_pressure {
            self.stats.pressure_flushes += 1;
            debug!(
                buffered_bytes = self.buffered_bytes,
                charged_bytes = self.charged_bytes,
                "Flushing streams: buffer under pressure"
            );
            return Some(self.take_all(FlushTrigger::Pressure, now));
        }

        None
    }

    /// Take every buffered stream regardless of thresholds.
    pub fn drain(&mut self, now: Instant) -> Batch {
        self.take_all(FlushTrigger::Drain, now)
    }

    /// Stop admitting entries. Already buffered entries stay until drained.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Restart the batch wait window, e.g. when the flush loop starts.
    pub fn reset_timer(&mut self, now: Instant) {
        self.last_flush = now;
    }

    /// Line bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Memory charged against `max_buffered_bytes`, including per-entry and
    /// per-stream overhead.
    pub fn charged_bytes(&self) -> usize {
        self.charged_bytes
    }

    pub fn buffered_entries(&self) -> usize {
        self.buffered_entries
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn occupancy(&self) -> Vec<StreamOccupancy> {
        self.streams
            .values()
            .map(|buffer| StreamOccupancy {
                key: buffer.key.clone(),
                entries: buffer.len(),
                bytes: buffer.byte_size,
            })
            .collect()
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.stats
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn take_all(&mut self, trigger: FlushTrigger, now: Instant) -> Batch {
        let streams = std::mem::take(&mut self.streams);
        self.buffered_bytes = 0;
        self.charged_bytes = 0;
        self.buffered_entries = 0;
        self.last_flush = now;
        self.under_pressure = false;
        Batch::new(trigger, streams.into_values().collect())
    }

    fn is_ready(config: &BatchConfig, buffer: &StreamBuffer) -> bool {
        buffer.byte_size >= config.max_batch_bytes || buffer.len() >= config.max_batch_entries
    }
}
