//! Per-shard pagination state.
//!
//! Created on first observation of a shard, and retained for the lifetime
//! of the job even if the shard later disappears from the directory (see
//! DESIGN.md), so a quarantined task can resume with its original counters
//! once the shard reappears.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ForestState {
    results_so_far: AtomicU64,
    /// Monotonic except that `retry()` may transiently clear it.
    is_done: AtomicBool,
}

impl ForestState {
    pub(crate) fn add_results(&self, n: u64) -> u64 {
        self.results_so_far.fetch_add(n, Ordering::SeqCst) + n
    }

    pub(crate) fn results_so_far(&self) -> u64 {
        self.results_so_far.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_done(&self) {
        self.is_done.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_done(&self) {
        self.is_done.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.is_done.load(Ordering::SeqCst)
    }
}
