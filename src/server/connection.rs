//! One ingestion connection: a reader stage decoding frames in receipt order
//! into a bounded queue, and a persist stage draining it.

use super::{incr, ServerState};
use crate::config::{IngestOverflow, ServerConfig};
use crate::error::ProtocolError;
use crate::event::Event;
use crate::frame;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest batch handed to persistence at once.
const PERSIST_BATCH: usize = 64;

enum Closed {
    PeerDone,
    Shutdown,
    Rejected,
}

pub(super) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    config: Arc<ServerConfig>,
    stop: watch::Receiver<bool>,
) {
    state.stats.connections_active.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let persist = tokio::spawn(persist_loop(rx, state.clone()));

    match read_loop(stream, &state, &config, tx, stop).await {
        Ok(Closed::PeerDone) => debug!(%peer, "peer closed connection"),
        Ok(Closed::Shutdown) => debug!(%peer, "connection closed for shutdown"),
        Ok(Closed::Rejected) => {
            incr(&state.stats.rejected_connections);
            warn!(%peer, "ingest queue full; connection rejected");
        }
        Err(ProtocolError::Idle) => {
            incr(&state.stats.idle_closed);
            debug!(%peer, "idle connection closed");
        }
        Err(e) => {
            incr(&state.stats.protocol_errors);
            info!(%peer, error = %e, "connection terminated");
        }
    }
    // The sender is gone once read_loop returns; the persist stage drains what
    // was queued and stops.
    if let Err(e) = persist.await {
        warn!(%peer, error = %e, "persist stage failed");
    }
    state.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
}

async fn read_loop(
    stream: TcpStream,
    state: &ServerState,
    config: &ServerConfig,
    tx: mpsc::Sender<Event>,
    mut stop: watch::Receiver<bool>,
) -> Result<Closed, ProtocolError> {
    let mut reader = BufReader::new(stream);
    let idle = config.read_idle_timeout();
    loop {
        let event = tokio::select! {
            _ = stop.changed() => return Ok(Closed::Shutdown),
            frame = frame::read_frame(&mut reader, config.max_frame_len, idle) => match frame? {
                Some(event) => event,
                None => return Ok(Closed::PeerDone),
            },
        };
        incr(&state.stats.events_received);

        match config.overflow {
            IngestOverflow::Wait => {
                match tokio::time::timeout(config.enqueue_timeout(), tx.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Ok(Closed::PeerDone),
                    Err(_) => incr(&state.stats.dropped),
                }
            }
            IngestOverflow::Drop => match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => incr(&state.stats.dropped),
                Err(TrySendError::Closed(_)) => return Ok(Closed::PeerDone),
            },
            IngestOverflow::Reject => match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    incr(&state.stats.dropped);
                    return Ok(Closed::Rejected);
                }
                Err(TrySendError::Closed(_)) => return Ok(Closed::PeerDone),
            },
        }
    }
}

async fn persist_loop(mut rx: mpsc::Receiver<Event>, state: Arc<ServerState>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < PERSIST_BATCH {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        state.ingest(batch).await;
    }
}
