//! Store statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = Store::in_memory(StoreConfig::default()).await?;
//! store.insert(doc).await?;
//!
//! let stats = store.stats();
//! println!("Inserts: {}", stats.inserts);
//! println!("Full scans: {}", stats.scans);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct StoreStats {
    // Mutations
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,

    // Reads
    index_lookups: AtomicU64,
    scans: AtomicU64,

    // Backend traffic
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,

    // Failures and lifecycle
    rollbacks: AtomicU64,
    backend_errors: AtomicU64,
    loads: AtomicU64,
}

impl StoreStats {
    /// Creates a zeroed stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_inserts(&self, count: usize) {
        self.inserts.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_updates(&self, count: usize) {
        self.updates.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_removes(&self, count: usize) {
        self.removes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_index_lookup(&self) {
        self.index_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            inserts: get(&self.inserts),
            updates: get(&self.updates),
            removes: get(&self.removes),
            index_lookups: get(&self.index_lookups),
            scans: get(&self.scans),
            bytes_written: get(&self.bytes_written),
            bytes_read: get(&self.bytes_read),
            rollbacks: get(&self.rollbacks),
            backend_errors: get(&self.backend_errors),
            loads: get(&self.loads),
        }
    }
}

/// A point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Documents inserted.
    pub inserts: u64,
    /// Documents updated.
    pub updates: u64,
    /// Documents removed.
    pub removes: u64,
    /// Queries answered through a secondary or `_id` index.
    pub index_lookups: u64,
    /// Queries answered by scanning every document.
    ///
    /// High scan counts may indicate missing indexes.
    pub scans: u64,
    /// Encoded bytes written to the backend.
    pub bytes_written: u64,
    /// Encoded bytes read from the backend.
    pub bytes_read: u64,
    /// Index batches rolled back after a failure.
    pub rollbacks: u64,
    /// Failed backend calls.
    pub backend_errors: u64,
    /// Completed loads.
    pub loads: u64,
}
