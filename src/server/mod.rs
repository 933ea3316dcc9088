//! Ingestion server: accepts framed event streams from monitored processes,
//! orders them per connection, suppresses retried duplicates, and hands them to
//! the aggregator and the persistence collaborator.
//!
//! ```text
//! socket ─► reader task ─► bounded queue ─► persist task ─► aggregator + store
//!            (one pair per connection)
//! ```

mod connection;

use crate::aggregate::{AggregateRecord, Aggregator};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::event::Event;
use crate::storage::EventPersistence;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub events_received: AtomicU64,
    pub events_persisted: AtomicU64,
    pub duplicates: AtomicU64,
    /// Dropped by the per-connection overflow policy
    pub dropped: AtomicU64,
    pub rejected_connections: AtomicU64,
    pub protocol_errors: AtomicU64,
    /// Closed after the read idle timeout with no partial frame pending
    pub idle_closed: AtomicU64,
    pub persist_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub events_received: u64,
    pub events_persisted: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub rejected_connections: u64,
    pub protocol_errors: u64,
    pub idle_closed: u64,
    pub persist_failures: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStatsSnapshot {
            connections_accepted: get(&self.connections_accepted),
            connections_active: get(&self.connections_active),
            events_received: get(&self.events_received),
            events_persisted: get(&self.events_persisted),
            duplicates: get(&self.duplicates),
            dropped: get(&self.dropped),
            rejected_connections: get(&self.rejected_connections),
            protocol_errors: get(&self.protocol_errors),
            idle_closed: get(&self.idle_closed),
            persist_failures: get(&self.persist_failures),
        }
    }
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared by all connections.
pub struct ServerState {
    aggregator: Aggregator,
    persistence: Arc<dyn EventPersistence>,
    /// Highest sequence accepted per origin
    ledger: Mutex<HashMap<Uuid, u64>>,
    stats: ServerStats,
}

/// Marks moved by one batch: origin -> (mark before the batch, last admitted).
type Advanced = HashMap<Uuid, (Option<u64>, u64)>;

impl ServerState {
    /// Accept `event` unless its origin already delivered this sequence.
    fn admit(&self, event: &Event, advanced: &mut Advanced) -> bool {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let high = ledger.get(&event.origin).copied();
        if matches!(high, Some(h) if event.sequence <= h) {
            return false;
        }
        ledger.insert(event.origin, event.sequence);
        advanced.entry(event.origin).or_insert((high, event.sequence)).1 = event.sequence;
        true
    }

    /// Put back the marks a failed batch advanced, so a resend is accepted.
    /// A mark another connection has since moved past is left alone.
    fn rewind(&self, advanced: Advanced) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        for (origin, (prior, last)) in advanced {
            if ledger.get(&origin) != Some(&last) {
                continue;
            }
            match prior {
                Some(mark) => ledger.insert(origin, mark),
                None => ledger.remove(&origin),
            };
        }
    }

    /// Dedup, aggregate and persist one batch from one connection, in order.
    async fn ingest(self: &Arc<Self>, batch: Vec<Event>) {
        let mut advanced = Advanced::new();
        let fresh: Vec<Event> = batch
            .into_iter()
            .filter(|e| {
                let ok = self.admit(e, &mut advanced);
                if !ok {
                    incr(&self.stats.duplicates);
                }
                ok
            })
            .collect();
        if fresh.is_empty() {
            return;
        }
        for event in &fresh {
            self.aggregator.record(event);
        }
        let persistence = self.persistence.clone();
        let n = fresh.len();
        match tokio::task::spawn_blocking(move || persistence.persist(&fresh)).await {
            Ok(Ok(written)) => {
                self.stats
                    .events_persisted
                    .fetch_add(written as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                incr(&self.stats.persist_failures);
                error!(error = %e, events = n, "persist failed");
                self.rewind(advanced);
            }
            Err(e) => {
                incr(&self.stats.persist_failures);
                error!(error = %e, events = n, "persist task failed");
                self.rewind(advanced);
            }
        }
    }
}

/// Read access to a running server's aggregates and counters.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    pub fn snapshot(&self) -> Vec<AggregateRecord> {
        self.state.aggregator.snapshot()
    }

    pub fn top(&self, n: usize) -> Vec<AggregateRecord> {
        self.state.aggregator.top(n)
    }

    pub fn aggregate(&self, identity_key: &str) -> Option<AggregateRecord> {
        self.state.aggregator.get(identity_key)
    }

    pub fn evicted(&self) -> u64 {
        self.state.aggregator.evicted()
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.state.stats.snapshot()
    }
}

pub struct IngestionServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
    instance: Uuid,
}

impl IngestionServer {
    /// Bind the listener. Failure here is fatal for the process.
    pub async fn bind(
        config: ServerConfig,
        persistence: Arc<dyn EventPersistence>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let state = Arc::new(ServerState {
            aggregator: Aggregator::new(config.aggregator_max_records),
            persistence,
            ledger: Mutex::new(HashMap::new()),
            stats: ServerStats::default(),
        });
        Ok(Self {
            listener,
            config: Arc::new(config),
            state,
            instance: Uuid::new_v4(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.clone(),
        }
    }

    /// Serve until `shutdown` resolves, then stop accepting and drain open
    /// connections for at most the configured drain timeout.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            config,
            state,
            instance,
        } = self;
        let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        info!(addr = %addr, instance = %instance, "ingestion server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let mut status =
            tokio::time::interval(Duration::from_secs(config.status_interval_secs.max(1)));
        status.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        incr(&state.stats.connections_accepted);
                        debug!(%peer, "connection accepted");
                        connections.spawn(connection::serve(
                            stream,
                            peer,
                            state.clone(),
                            config.clone(),
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        warn!(error = %e, "connection task failed");
                    }
                }
                _ = status.tick() => log_status(&state),
            }
        }

        info!(open = connections.len(), "shutting down; draining connections");
        drop(listener);
        let _ = stop_tx.send(true);
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(config.drain_timeout(), drain)
            .await
            .is_err()
        {
            warn!(open = connections.len(), "drain timeout; aborting connections");
            connections.shutdown().await;
        }
        log_status(&state);
        info!("ingestion server stopped");
    }
}

fn log_status(state: &ServerState) {
    let stats = state.stats.snapshot();
    let top: Vec<String> = state
        .aggregator
        .top(5)
        .into_iter()
        .map(|r| format!("{}={}", r.identity_key, r.count))
        .collect();
    info!(
        connections = stats.connections_active,
        received = stats.events_received,
        persisted = stats.events_persisted,
        duplicates = stats.duplicates,
        dropped = stats.dropped,
        protocol_errors = stats.protocol_errors,
        idle_closed = stats.idle_closed,
        top = ?top,
        "ingestion status"
    );
}
