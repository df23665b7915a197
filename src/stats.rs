//! Operation counters for observing tree behavior.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct TreeStatsSnapshot {
    /// Number of leaf probes performed.
    pub leaf_searches: u64,
    /// Number of inner-node descents performed.
    pub inner_searches: u64,
    /// Number of leaf splits performed.
    pub leaf_splits: u64,
    /// Number of inner-node splits performed.
    pub inner_splits: u64,
    /// Number of inner-node merges performed.
    pub inner_merges: u64,
    /// Number of inner-node borrow rotations performed.
    pub inner_borrows: u64,
    /// Number of leaves unlinked by deletes.
    pub leaf_unlinks: u64,
    /// Number of optimistic attempts that aborted and retried.
    pub optimistic_aborts: u64,
    /// Number of operations that escalated to the writer-mode lock.
    pub fallback_acquires: u64,
    /// Number of split logs replayed during recovery.
    pub recovered_splits: u64,
    /// Number of delete logs replayed during recovery.
    pub recovered_deletes: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct TreeStats {
    leaf_searches: AtomicU64,
    inner_searches: AtomicU64,
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    inner_merges: AtomicU64,
    inner_borrows: AtomicU64,
    leaf_unlinks: AtomicU64,
    optimistic_aborts: AtomicU64,
    fallback_acquires: AtomicU64,
    recovered_splits: AtomicU64,
    recovered_deletes: AtomicU64,
}

impl TreeStats {
    /// Returns the current count of leaf probes.
    pub fn leaf_searches(&self) -> u64 {
        self.leaf_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner-node descents.
    pub fn inner_searches(&self) -> u64 {
        self.inner_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner-node splits.
    pub fn inner_splits(&self) -> u64 {
        self.inner_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner-node merges.
    pub fn inner_merges(&self) -> u64 {
        self.inner_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner-node borrows.
    pub fn inner_borrows(&self) -> u64 {
        self.inner_borrows.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaves unlinked by deletes.
    pub fn leaf_unlinks(&self) -> u64 {
        self.leaf_unlinks.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of aborted optimistic attempts.
    pub fn optimistic_aborts(&self) -> u64 {
        self.optimistic_aborts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of writer-mode fallback acquisitions.
    pub fn fallback_acquires(&self) -> u64 {
        self.fallback_acquires.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of split logs replayed during recovery.
    pub fn recovered_splits(&self) -> u64 {
        self.recovered_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of delete logs replayed during recovery.
    pub fn recovered_deletes(&self) -> u64 {
        self.recovered_deletes.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_searches(&self) {
        self.inner_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_splits(&self) {
        self.inner_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_merges(&self) {
        self.inner_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_borrows(&self) {
        self.inner_borrows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_unlinks(&self) {
        self.leaf_unlinks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_optimistic_aborts(&self) {
        self.optimistic_aborts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_fallback_acquires(&self) {
        self.fallback_acquires.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_recovered_splits(&self) {
        self.recovered_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_recovered_deletes(&self) {
        self.recovered_deletes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            leaf_searches: self.leaf_searches(),
            inner_searches: self.inner_searches(),
            leaf_splits: self.leaf_splits(),
            inner_splits: self.inner_splits(),
            inner_merges: self.inner_merges(),
            inner_borrows: self.inner_borrows(),
            leaf_unlinks: self.leaf_unlinks(),
            optimistic_aborts: self.optimistic_aborts(),
            fallback_acquires: self.fallback_acquires(),
            recovered_splits: self.recovered_splits(),
            recovered_deletes: self.recovered_deletes(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "fptree::stats",
            leaf_searches = snapshot.leaf_searches,
            inner_searches = snapshot.inner_searches,
            leaf_splits = snapshot.leaf_splits,
            inner_splits = snapshot.inner_splits,
            inner_merges = snapshot.inner_merges,
            inner_borrows = snapshot.inner_borrows,
            leaf_unlinks = snapshot.leaf_unlinks,
            optimistic_aborts = snapshot.optimistic_aborts,
            fallback_acquires = snapshot.fallback_acquires,
            recovered_splits = snapshot.recovered_splits,
            recovered_deletes = snapshot.recovered_deletes,
            "tree stats snapshot"
        );
    }
}
