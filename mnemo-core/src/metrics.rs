//! # Metrics and Monitoring
//!
//! Counters for monitoring MnemoDB. Cheap to clone; all clones share the
//! same counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Engine-wide counters.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Write metrics
    updates: AtomicU64,
    records_written: AtomicU64,
    update_errors: AtomicU64,

    // Read metrics
    queries: AtomicU64,
    scans: AtomicU64,
    query_errors: AtomicU64,

    // WAL metrics
    wal_entries: AtomicU64,
    wal_bytes: AtomicU64,
    segment_writes: AtomicU64,
    segment_bytes: AtomicU64,
    write_retries: AtomicU64,
    data_loss_events: AtomicU64,
    replayed_entries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an applied update batch
    pub fn record_update(&self, records: u64) {
        self.inner.updates.fetch_add(1, Ordering::Relaxed);
        self.inner.records_written.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_update_error(&self) {
        self.inner.update_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.inner.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.inner.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_error(&self) {
        self.inner.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record WAL entry queued for durability
    pub fn record_wal_append(&self, bytes: u64) {
        self.inner.wal_entries.fetch_add(1, Ordering::Relaxed);
        self.inner.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a segment successfully written to the object store
    pub fn record_segment_write(&self, bytes: u64) {
        self.inner.segment_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.segment_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write_retry(&self) {
        self.inner.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_loss(&self) {
        self.inner.data_loss_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self, entries: u64) {
        self.inner.replayed_entries.fetch_add(entries, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            updates: self.inner.updates.load(Ordering::Relaxed),
            records_written: self.inner.records_written.load(Ordering::Relaxed),
            update_errors: self.inner.update_errors.load(Ordering::Relaxed),
            queries: self.inner.queries.load(Ordering::Relaxed),
            scans: self.inner.scans.load(Ordering::Relaxed),
            query_errors: self.inner.query_errors.load(Ordering::Relaxed),
            wal_entries: self.inner.wal_entries.load(Ordering::Relaxed),
            wal_bytes: self.inner.wal_bytes.load(Ordering::Relaxed),
            segment_writes: self.inner.segment_writes.load(Ordering::Relaxed),
            segment_bytes: self.inner.segment_bytes.load(Ordering::Relaxed),
            write_retries: self.inner.write_retries.load(Ordering::Relaxed),
            data_loss_events: self.inner.data_loss_events.load(Ordering::Relaxed),
            replayed_entries: self.inner.replayed_entries.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub updates: u64,
    pub records_written: u64,
    pub update_errors: u64,
    pub queries: u64,
    pub scans: u64,
    pub query_errors: u64,
    pub wal_entries: u64,
    pub wal_bytes: u64,
    pub segment_writes: u64,
    pub segment_bytes: u64,
    pub write_retries: u64,
    pub data_loss_events: u64,
    pub replayed_entries: u64,
}

/// Logs the duration of an operation at debug level when stopped.
pub struct Timer {
    started: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            started: Instant::now(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            operation = self.operation,
            elapsed_us = elapsed.as_micros() as u64,
            "Timed operation finished"
        );
        elapsed
    }
}
