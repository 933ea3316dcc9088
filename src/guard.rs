//! Per-execution-context reentrancy guard.
//!
//! An interceptor enters the guard before doing any capture work and leaves it
//! when the returned [`GuardScope`] drops. While the guard is held, every other
//! interceptor fired on the same context (for example by the file write the
//! logging path performs) sees `is_safe_to_continue() == false` and returns
//! without doing anything. Contexts never share guard state.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ExecutionContext = ExecutionContext::new(next_context_id());
}

fn next_context_id() -> u64 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A logical thread of execution and its "inside instrumentation" flag.
///
/// Not `Sync`: a context is only ever touched by the execution it represents.
#[derive(Debug)]
pub struct ExecutionContext {
    id: u64,
    entered_at: Cell<Option<Instant>>,
    stale_after: Option<Duration>,
}

impl ExecutionContext {
    /// A standalone context, e.g. a simulated fiber in tests.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            entered_at: Cell::new(None),
            stale_after: None,
        }
    }

    /// A standalone context with a fresh process-unique id.
    pub fn detached() -> Self {
        Self::new(next_context_id())
    }

    /// Treat a guard held longer than `limit` as leaked and let interceptors run again.
    pub fn with_stale_after(mut self, limit: Duration) -> Self {
        self.stale_after = Some(limit);
        self
    }

    /// Run `f` with the context of the calling OS thread.
    pub fn with_current<R>(f: impl FnOnce(&ExecutionContext) -> R) -> R {
        CURRENT.with(f)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the context as inside instrumentation. Mismatched calls are tolerated.
    pub fn enter(&self) {
        self.entered_at.set(Some(Instant::now()));
    }

    pub fn exit(&self) {
        self.entered_at.set(None);
    }

    pub fn is_safe_to_continue(&self) -> bool {
        match (self.entered_at.get(), self.stale_after) {
            (None, _) => true,
            (Some(at), Some(limit)) => at.elapsed() >= limit,
            (Some(_), None) => false,
        }
    }

    /// Enter the guard if it is free. The scope exits on drop, unwinding included.
    pub fn try_enter(&self) -> Option<GuardScope<'_>> {
        if !self.is_safe_to_continue() {
            return None;
        }
        self.enter();
        Some(GuardScope { ctx: self })
    }
}

/// Held guard; clears the flag when dropped.
#[must_use = "the guard is released as soon as the scope is dropped"]
pub struct GuardScope<'a> {
    ctx: &'a ExecutionContext,
}

impl GuardScope<'_> {
    pub fn context(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        self.ctx.exit();
    }
}
