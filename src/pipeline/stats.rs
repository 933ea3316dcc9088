//! Pipeline counters. Losses are counted here, never raised as errors.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub enqueued: AtomicU64,
    /// Overflow drops: `dropNewest`, `dropOldest` evictions and `wait` timeouts
    pub dropped: AtomicU64,
    pub rejected: AtomicU64,
    pub dispatched: AtomicU64,
    pub retried_batches: AtomicU64,
    /// Given up after the retry bound, or squeezed out on requeue
    pub lost: AtomicU64,
    pub discarded_on_shutdown: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            retried_batches: self.retried_batches.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            discarded_on_shutdown: self.discarded_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub retried_batches: u64,
    pub lost: u64,
    pub discarded_on_shutdown: u64,
}

impl StatsSnapshot {
    /// Every event that will never reach the sink.
    pub fn total_loss(&self) -> u64 {
        self.dropped + self.rejected + self.lost + self.discarded_on_shutdown
    }
}
