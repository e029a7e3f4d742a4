//! Delivery counters.
//!
//! Counters are plain atomics owned by a dispatcher instance; a
//! [`MetricsSnapshot`] is a point-in-time copy suitable for export.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::batcher::{Batcher, StreamOccupancy};
use crate::sender::{DeliveryReport, DeliveryState};

/// Counters updated by the dispatcher and its workers.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Entries admitted into the batcher
    pub entries_submitted: AtomicU64,

    /// `enqueue` calls refused, for any reason
    pub entries_rejected: AtomicU64,

    /// Entries lost: refused under `drop_new`, or part of a payload that
    /// failed encoding, was rejected by the server or ran out of retries
    pub entries_dropped: AtomicU64,

    pub entries_delivered: AtomicU64,

    /// Log line bytes lost before encoding: `drop_new` refusals and batches
    /// that failed to encode
    pub line_bytes_dropped: AtomicU64,

    /// Encoded (possibly compressed) bytes of payloads the server rejected or
    /// that ran out of retries
    pub payload_bytes_dropped: AtomicU64,

    pub payloads_delivered: AtomicU64,

    /// Retry attempts across all payloads
    pub payloads_retried: AtomicU64,

    /// Payloads rejected permanently by the server
    pub payloads_failed: AtomicU64,

    /// Payloads dropped after the retry budget ran out
    pub payloads_exhausted: AtomicU64,

    pub encoding_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.entries_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a refused entry. `dropped` marks refusals that discard data.
    pub(crate) fn record_rejected(&self, dropped: bool, bytes: usize) {
        self.entries_rejected.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.entries_dropped.fetch_add(1, Ordering::Relaxed);
            self.line_bytes_dropped
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_encoding_failure(&self, entries: usize, bytes: usize) {
        self.encoding_failures.fetch_add(1, Ordering::Relaxed);
        self.entries_dropped
            .fetch_add(entries as u64, Ordering::Relaxed);
        self.line_bytes_dropped
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, report: &DeliveryReport) {
        self.payloads_retried
            .fetch_add(report.retries() as u64, Ordering::Relaxed);

        let counter = match report.state {
            DeliveryState::Delivered => {
                self.entries_delivered
                    .fetch_add(report.entries as u64, Ordering::Relaxed);
                &self.payloads_delivered
            }
            DeliveryState::Failed { .. } => &self.payloads_failed,
            DeliveryState::Exhausted { .. } => &self.payloads_exhausted,
            // Reports are only produced for terminal states.
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if !report.is_delivered() {
            self.entries_dropped
                .fetch_add(report.entries as u64, Ordering::Relaxed);
            self.payload_bytes_dropped
                .fetch_add(report.encoded_bytes as u64, Ordering::Relaxed);
        }
    }

    /// Copy the counters together with the batcher's current occupancy.
    pub fn snapshot(&self, batcher: &Batcher) -> MetricsSnapshot {
        let stats = batcher.stats();
        MetricsSnapshot {
            entries_submitted: self.entries_submitted.load(Ordering::Relaxed),
            entries_rejected: self.entries_rejected.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            entries_delivered: self.entries_delivered.load(Ordering::Relaxed),
            line_bytes_dropped: self.line_bytes_dropped.load(Ordering::Relaxed),
            payload_bytes_dropped: self.payload_bytes_dropped.load(Ordering::Relaxed),
            payloads_delivered: self.payloads_delivered.load(Ordering::Relaxed),
            payloads_retried: self.payloads_retried.load(Ordering::Relaxed),
            payloads_failed: self.payloads_failed.load(Ordering::Relaxed),
            payloads_exhausted: self.payloads_exhausted.load(Ordering::Relaxed),
            encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
            bytes_buffered: batcher.buffered_bytes() as u64,
            bytes_charged: batcher.charged_bytes() as u64,
            entries_buffered: batcher.buffered_entries() as u64,
            out_of_order: stats.out_of_order,
            size_flushes: stats.size_flushes,
            time_flushes: stats.time_flushes,
            pressure_flushes: stats.pressure_flushes,
            streams: batcher.occupancy(),
        }
    }
}

/// Point-in-time copy of [`Metrics`] plus buffer gauges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub entries_submitted: u64,
    pub entries_rejected: u64,
    pub entries_dropped: u64,
    pub entries_delivered: u64,
    pub line_bytes_dropped: u64,
    pub payload_bytes_dropped: u64,
    pub payloads_delivered: u64,
    pub payloads_retried: u64,
    pub payloads_failed: u64,
    pub payloads_exhausted: u64,
    pub encoding_failures: u64,
    /// Line bytes buffered
    pub bytes_buffered: u64,

    /// Memory charged against `max_buffered_bytes`
    pub bytes_charged: u64,
    pub entries_buffered: u64,
    pub out_of_order: u64,
    pub size_flushes: u64,
    pub time_flushes: u64,
    pub pressure_flushes: u64,

    /// Per-stream occupancy, sorted by stream key
    pub streams: Vec<StreamOccupancy>,
}
