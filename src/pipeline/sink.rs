//! Event sinks: where the dispatcher delivers batches.

use crate::config::SinkConfig;
use crate::error::TransportError;
use crate::event::Event;
use crate::frame;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Instant;
use tracing::{debug, info};

/// Destination for dispatched batches. Called only from the dispatcher thread.
pub trait EventSink: Send {
    /// Deliver the whole batch or fail; a failed batch is retried as a unit.
    fn send(&mut self, batch: &[Event]) -> Result<(), TransportError>;

    fn close(&mut self) {}
}

impl<F> EventSink for F
where
    F: FnMut(&[Event]) -> Result<(), TransportError> + Send,
{
    fn send(&mut self, batch: &[Event]) -> Result<(), TransportError> {
        self(batch)
    }
}

/// Ships frames to an ingestion server over one long-lived TCP connection.
///
/// Connects lazily; any failure drops the connection so the next batch reconnects.
/// A connection left unused past `idle_timeout`, or already closed by the
/// server, is replaced before writing.
pub struct TcpSink {
    config: SinkConfig,
    stream: Option<TcpStream>,
    last_write: Instant,
    scratch: Vec<u8>,
}

impl TcpSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            stream: None,
            last_write: Instant::now(),
            scratch: Vec::with_capacity(16 * 1024),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = &self.config.address;
        let connect_err = |source| TransportError::Connect {
            addr: addr.clone(),
            source,
        };
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&sock_addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(self.config.write_timeout))?;
                    stream.set_nodelay(true)?;
                    info!(addr = %sock_addr, "sink connected");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(connect_err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
        })))
    }
}

/// Whether the peer still has the connection open. A server that closed it
/// shows as EOF or a reset on a non-blocking peek; a write would still
/// succeed locally and the bytes would be lost.
fn is_alive(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut byte = [0u8; 1];
    let alive = match stream.peek(&mut byte) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && alive
}

impl EventSink for TcpSink {
    fn send(&mut self, batch: &[Event]) -> Result<(), TransportError> {
        let idle = self.last_write.elapsed();
        let reusable = self.stream.take().filter(|s| {
            if idle >= self.config.idle_timeout {
                debug!(idle_ms = idle.as_millis() as u64, "sink connection idle; reconnecting");
                false
            } else if !is_alive(s) {
                debug!("sink connection closed by peer; reconnecting");
                false
            } else {
                true
            }
        });
        let mut stream = match reusable {
            Some(s) => s,
            None => self.connect()?,
        };
        self.scratch.clear();
        for event in batch {
            frame::encode_frame(event, &mut self.scratch);
        }
        match stream.write_all(&self.scratch).and_then(|_| stream.flush()) {
            Ok(()) => {
                self.stream = Some(stream);
                self.last_write = Instant::now();
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "sink write failed; dropping connection");
                Err(TransportError::Write(e))
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
