//! Background dispatcher: drains the buffer in FIFO order and hands batches to
//! the sink. Runs on its own thread so producers never touch network I/O.

use super::buffer::{BufferEntry, EventBuffer};
use super::sink::EventSink;
use super::stats::{PipelineStats, StatsSnapshot};
use crate::config::PipelineConfig;
use crate::event::Event;
use crate::guard::ExecutionContext;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extra time granted past the shutdown grace period before the thread is abandoned.
const JOIN_MARGIN: Duration = Duration::from_millis(500);

pub struct Dispatcher {
    buffer: Arc<EventBuffer>,
    handle: Option<JoinHandle<()>>,
    done: mpsc::Receiver<()>,
    grace: Duration,
}

impl Dispatcher {
    pub fn spawn(
        buffer: Arc<EventBuffer>,
        sink: Box<dyn EventSink>,
        config: &PipelineConfig,
    ) -> std::io::Result<Self> {
        let (done_tx, done) = mpsc::channel();
        let worker = Worker {
            buffer: buffer.clone(),
            sink,
            config: config.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("watchpost-dispatcher".into())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            })?;
        Ok(Self {
            buffer,
            handle: Some(handle),
            done,
            grace: config.shutdown_grace,
        })
    }

    /// Close the buffer, let the worker flush for at most the grace period, and
    /// return the final counters. Never blocks longer than grace + margin.
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.buffer.close();
        match self.done.recv_timeout(self.grace + JOIN_MARGIN) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("dispatcher did not stop within the grace period; detaching");
            }
        }
        self.buffer.stats().snapshot()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

struct Worker {
    buffer: Arc<EventBuffer>,
    sink: Box<dyn EventSink>,
    config: PipelineConfig,
}

impl Worker {
    fn stats(&self) -> &PipelineStats {
        self.buffer.stats()
    }

    fn run(mut self) {
        // Everything this thread does is shipping machinery; no interceptor may
        // observe it.
        ExecutionContext::with_current(|ctx| ctx.enter());

        let mut last_report = Instant::now();
        let mut reported = StatsSnapshot::default();
        loop {
            if self.buffer.is_closed() {
                self.final_flush();
                break;
            }
            let batch = self
                .buffer
                .next_batch(self.config.batch_size, self.config.flush_interval);
            if !batch.is_empty() {
                self.deliver(batch);
            }
            if last_report.elapsed() >= self.config.report_interval {
                reported = self.report(reported);
                last_report = Instant::now();
            }
        }
        self.sink.close();
        self.report(reported);
    }

    fn deliver(&mut self, mut batch: Vec<BufferEntry>) {
        let events: Vec<Event> = batch.iter().map(|e| e.event.clone()).collect();
        match self.sink.send(&events) {
            Ok(()) => {
                PipelineStats::add(&self.stats().dispatched, events.len() as u64);
            }
            Err(e) => {
                warn!(error = %e, batch = events.len(), "dispatch failed");
                PipelineStats::incr(&self.stats().retried_batches);
                for entry in batch.iter_mut() {
                    entry.attempts += 1;
                }
                let max = self.config.max_retries;
                let (retry, exhausted): (Vec<_>, Vec<_>) =
                    batch.into_iter().partition(|e| e.attempts <= max);
                if !exhausted.is_empty() {
                    warn!(lost = exhausted.len(), "retry bound reached; events lost");
                    PipelineStats::add(&self.stats().lost, exhausted.len() as u64);
                }
                if !retry.is_empty() {
                    self.buffer.requeue_front(retry);
                }
                self.buffer.wait_closed(self.config.retry_backoff);
            }
        }
    }

    /// Best effort delivery of what is left, bounded by the grace period.
    fn final_flush(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        while Instant::now() < deadline {
            let batch = self.buffer.take(self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            let events: Vec<Event> = batch.iter().map(|e| e.event.clone()).collect();
            match self.sink.send(&events) {
                Ok(()) => PipelineStats::add(&self.stats().dispatched, events.len() as u64),
                Err(e) => {
                    warn!(error = %e, "final flush failed");
                    PipelineStats::add(&self.stats().discarded_on_shutdown, events.len() as u64);
                    break;
                }
            }
        }
        let left = self.buffer.discard_all();
        if left > 0 {
            PipelineStats::add(&self.stats().discarded_on_shutdown, left as u64);
            warn!(discarded = left, "unflushed events discarded at shutdown");
        } else {
            debug!("buffer flushed");
        }
    }

    fn report(&self, previous: StatsSnapshot) -> StatsSnapshot {
        let now = self.stats().snapshot();
        if now != previous {
            info!(
                enqueued = now.enqueued,
                dispatched = now.dispatched,
                dropped = now.dropped,
                rejected = now.rejected,
                lost = now.lost,
                "pipeline stats"
            );
        }
        now
    }
}
