//! Bounded FIFO between capturing contexts and the dispatcher.
//!
//! Many producers, one consumer. The length never exceeds `capacity`; what
//! happens to an event that does not fit is decided by the configured
//! [`OverflowStrategy`] and always counted.

use super::stats::PipelineStats;
use crate::config::OverflowStrategy;
use crate::event::Event;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A buffered event and its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub event: Event,
    pub enqueued_at: Instant,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

/// Result of [`EventBuffer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Accepted after evicting the oldest entry
    AcceptedEvicting,
    /// Discarded under `dropNewest`
    Dropped,
    /// Refused under `reject`; the caller decides
    Rejected,
    /// No space freed within the wait timeout; discarded
    TimedOut,
    /// The buffer is shut down
    Closed,
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted | EnqueueOutcome::AcceptedEvicting)
    }
}

struct State {
    queue: VecDeque<BufferEntry>,
    closed: bool,
}

pub struct EventBuffer {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    strategy: OverflowStrategy,
    wait_timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl EventBuffer {
    pub fn new(capacity: usize, strategy: OverflowStrategy, wait_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            strategy,
            wait_timeout,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> OverflowStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of the buffered events in dispatch order.
    pub fn pending(&self) -> Vec<Event> {
        self.lock().queue.iter().map(|e| e.event.clone()).collect()
    }

    // Capture must never panic the host, so a poisoned lock is simply reused.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, event: Event) -> EnqueueOutcome {
        self.enqueue_with(|| event)
    }

    /// Enqueue an event built while the buffer lock is held, so that events
    /// stamped by one factory sit in the queue in sequence order. `build` is
    /// not called when the event would be discarded.
    pub fn enqueue_with(&self, build: impl FnOnce() -> Event) -> EnqueueOutcome {
        let mut state = self.lock();
        if state.closed {
            return EnqueueOutcome::Closed;
        }
        let mut outcome = EnqueueOutcome::Accepted;
        if state.queue.len() >= self.capacity {
            match self.strategy {
                OverflowStrategy::DropNewest => {
                    PipelineStats::incr(&self.stats.dropped);
                    return EnqueueOutcome::Dropped;
                }
                OverflowStrategy::Reject => {
                    PipelineStats::incr(&self.stats.rejected);
                    return EnqueueOutcome::Rejected;
                }
                OverflowStrategy::DropOldest => {
                    state.queue.pop_front();
                    PipelineStats::incr(&self.stats.dropped);
                    outcome = EnqueueOutcome::AcceptedEvicting;
                }
                OverflowStrategy::Wait => {
                    let (guard, timeout) = self
                        .not_full
                        .wait_timeout_while(state, self.wait_timeout, |s| {
                            !s.closed && s.queue.len() >= self.capacity
                        })
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    if state.closed {
                        return EnqueueOutcome::Closed;
                    }
                    if timeout.timed_out() && state.queue.len() >= self.capacity {
                        PipelineStats::incr(&self.stats.dropped);
                        return EnqueueOutcome::TimedOut;
                    }
                }
            }
        }
        state.queue.push_back(BufferEntry {
            event: build(),
            enqueued_at: Instant::now(),
            attempts: 0,
        });
        PipelineStats::incr(&self.stats.enqueued);
        drop(state);
        self.not_empty.notify_one();
        outcome
    }

    /// Wait until `max` entries are buffered, `wait` elapses or the buffer
    /// closes, then take up to `max` entries from the head.
    pub fn next_batch(&self, max: usize, wait: Duration) -> Vec<BufferEntry> {
        let state = self.lock();
        let (mut state, _) = self
            .not_empty
            .wait_timeout_while(state, wait, |s| !s.closed && s.queue.len() < max)
            .unwrap_or_else(PoisonError::into_inner);
        let n = state.queue.len().min(max);
        let batch: Vec<BufferEntry> = state.queue.drain(..n).collect();
        drop(state);
        if !batch.is_empty() {
            self.not_full.notify_all();
        }
        batch
    }

    /// Take up to `max` entries without waiting.
    pub fn take(&self, max: usize) -> Vec<BufferEntry> {
        self.next_batch(max, Duration::ZERO)
    }

    /// Put a failed batch back at the head, preserving its order. Entries that
    /// no longer fit are dropped oldest-first; returns how many were lost.
    pub fn requeue_front(&self, entries: Vec<BufferEntry>) -> usize {
        let mut state = self.lock();
        let room = self.capacity.saturating_sub(state.queue.len());
        let lost = entries.len().saturating_sub(room);
        for entry in entries.into_iter().skip(lost).rev() {
            state.queue.push_front(entry);
        }
        drop(state);
        if lost > 0 {
            PipelineStats::add(&self.stats.lost, lost as u64);
        }
        self.not_empty.notify_one();
        lost
    }

    /// Stop accepting events and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Sleep for `dur` unless the buffer closes first. Returns true if closed.
    pub fn wait_closed(&self, dur: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .not_empty
            .wait_timeout_while(state, dur, |s| !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.closed
    }

    /// Drop everything still buffered; returns the count.
    pub fn discard_all(&self) -> usize {
        let mut state = self.lock();
        let n = state.queue.len();
        state.queue.clear();
        drop(state);
        self.not_full.notify_all();
        n
    }
}
