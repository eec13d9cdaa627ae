//! Loader counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters of one loader instance
#[derive(Debug, Default)]
pub struct LoaderStats {
    /// Messages returned by polls
    pub messages_received: AtomicU64,
    /// Successful upserts (replays included)
    pub snapshots_written: AtomicU64,
    /// Messages dropped as malformed
    pub malformed_dropped: AtomicU64,
    /// Durable store commits
    pub commits: AtomicU64,
    /// Queue checkpoints acknowledged
    pub checkpoints: AtomicU64,
    /// Table/partition repairs completed
    pub schema_repairs: AtomicU64,
    /// Store connections rebuilt
    pub connection_resets: AtomicU64,
    /// Poll batches abandoned for re-delivery
    pub abandoned_batches: AtomicU64,
}

impl LoaderStats {
    /// Add `n` to a counter
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment a counter
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> LoaderStatsSnapshot {
        LoaderStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            schema_repairs: self.schema_repairs.load(Ordering::Relaxed),
            connection_resets: self.connection_resets.load(Ordering::Relaxed),
            abandoned_batches: self.abandoned_batches.load(Ordering::Relaxed),
        }
    }
}

/// Loader counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStatsSnapshot {
    /// Messages returned by polls
    pub messages_received: u64,
    /// Successful upserts (replays included)
    pub snapshots_written: u64,
    /// Messages dropped as malformed
    pub malformed_dropped: u64,
    /// Durable store commits
    pub commits: u64,
    /// Queue checkpoints acknowledged
    pub checkpoints: u64,
    /// Table/partition repairs completed
    pub schema_repairs: u64,
    /// Store connections rebuilt
    pub connection_resets: u64,
    /// Poll batches abandoned for re-delivery
    pub abandoned_batches: u64,
}
