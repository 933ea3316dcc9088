//! Ingestion server: per-connection isolation, duplicate suppression, overflow
//! and shutdown drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;
use watchpost::config::{IngestOverflow, ServerConfig};
use watchpost::error::StoreError;
use watchpost::event::{Attributes, Event, EventFactory, EventType};
use watchpost::frame::encode_frame;
use watchpost::server::{IngestionServer, ServerHandle};
use watchpost::storage::EventPersistence;

#[derive(Default)]
struct CountingStore {
    written: AtomicUsize,
    delay: Duration,
    /// Calls left that fail before writes succeed
    failures: AtomicUsize,
}

impl EventPersistence for CountingStore {
    fn persist(&self, events: &[Event]) -> Result<usize, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Poisoned);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.written.fetch_add(events.len(), Ordering::SeqCst);
        Ok(events.len())
    }
}

struct Running {
    addr: std::net::SocketAddr,
    handle: ServerHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn start(config: ServerConfig, store: Arc<CountingStore>) -> Running {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".into(),
        ..config
    };
    let server = IngestionServer::bind(config, store).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let (stop, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(async {
        let _ = rx.await;
    }));
    Running {
        addr,
        handle,
        stop,
        task,
    }
}

async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

fn frames(events: &[Event]) -> Vec<u8> {
    let mut buf = Vec::new();
    for e in events {
        encode_frame(e, &mut buf);
    }
    buf
}

fn connects(factory: &EventFactory, host: &str, n: usize) -> Vec<Event> {
    (0..n)
        .map(|_| {
            factory.build(
                1,
                EventType::SocketConnect,
                None,
                Attributes::new().with("host", host).with("port", "443"),
            )
        })
        .collect()
}

#[tokio::test]
async fn malformed_frame_only_closes_its_connection() {
    let store = Arc::new(CountingStore::default());
    let server = start(ServerConfig::default(), store.clone()).await;
    let factory = EventFactory::new(Uuid::new_v4());

    let mut good = TcpStream::connect(server.addr).await.unwrap();
    let mut bad = TcpStream::connect(server.addr).await.unwrap();

    good.write_all(&frames(&connects(&factory, "10.0.0.1", 2))).await.unwrap();

    let body = b"not a record";
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&(body.len() as u32).to_le_bytes());
    garbage.extend_from_slice(&0xdead_beefu32.to_le_bytes());
    garbage.extend_from_slice(body);
    bad.write_all(&garbage).await.unwrap();

    let mut byte = [0u8; 1];
    let closed = tokio::time::timeout(Duration::from_secs(5), bad.read(&mut byte))
        .await
        .unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));

    good.write_all(&frames(&connects(&factory, "10.0.0.1", 1))).await.unwrap();
    let h = server.handle.clone();
    assert!(eventually(|| h.aggregate("SOCKET_CONNECT10.0.0.1").map(|r| r.count) == Some(3)).await);

    let stats = server.handle.stats();
    assert_eq!(stats.protocol_errors, 1);
    assert_eq!(stats.events_received, 3);
    assert!(eventually(|| store.written.load(Ordering::SeqCst) == 3).await);

    drop(good);
    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn retried_events_are_not_counted_twice() {
    let store = Arc::new(CountingStore::default());
    let server = start(ServerConfig::default(), store.clone()).await;
    let factory = EventFactory::new(Uuid::new_v4());
    let batch = connects(&factory, "10.0.0.2", 3);

    // Same batch over two connections, as a sender retrying after a reconnect.
    for round in 1..=2u64 {
        let mut conn = TcpStream::connect(server.addr).await.unwrap();
        conn.write_all(&frames(&batch)).await.unwrap();
        conn.shutdown().await.unwrap();
        let h = server.handle.clone();
        assert!(eventually(|| h.stats().events_received == 3 * round).await);
    }
    let h = server.handle.clone();
    assert!(eventually(|| h.stats().duplicates == 3).await);
    assert_eq!(
        server.handle.aggregate("SOCKET_CONNECT10.0.0.2").unwrap().count,
        3
    );
    assert!(eventually(|| store.written.load(Ordering::SeqCst) == 3).await);

    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn resend_after_failed_persist_is_accepted() {
    let store = Arc::new(CountingStore {
        failures: AtomicUsize::new(1),
        ..Default::default()
    });
    let server = start(ServerConfig::default(), store.clone()).await;
    let factory = EventFactory::new(Uuid::new_v4());
    let batch = connects(&factory, "10.0.0.4", 1);

    let mut first = TcpStream::connect(server.addr).await.unwrap();
    first.write_all(&frames(&batch)).await.unwrap();
    first.shutdown().await.unwrap();
    let h = server.handle.clone();
    assert!(eventually(|| h.stats().persist_failures == 1).await);
    assert_eq!(store.written.load(Ordering::SeqCst), 0);

    let mut second = TcpStream::connect(server.addr).await.unwrap();
    second.write_all(&frames(&batch)).await.unwrap();
    second.shutdown().await.unwrap();
    assert!(eventually(|| store.written.load(Ordering::SeqCst) == 1).await);
    assert_eq!(server.handle.stats().duplicates, 0);

    // Once stored, a further resend is a duplicate again.
    let mut third = TcpStream::connect(server.addr).await.unwrap();
    third.write_all(&frames(&batch)).await.unwrap();
    third.shutdown().await.unwrap();
    let h = server.handle.clone();
    assert!(eventually(|| h.stats().duplicates == 1).await);
    assert_eq!(store.written.load(Ordering::SeqCst), 1);

    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn aggregates_rank_by_frequency() {
    let server = start(ServerConfig::default(), Arc::new(CountingStore::default())).await;
    let factory = EventFactory::new(Uuid::new_v4());
    let mut events = Vec::new();
    events.extend(connects(&factory, "b.example", 3));
    events.extend(connects(&factory, "a.example", 5));
    events.extend(connects(&factory, "c.example", 3));

    let mut conn = TcpStream::connect(server.addr).await.unwrap();
    conn.write_all(&frames(&events)).await.unwrap();
    let h = server.handle.clone();
    assert!(eventually(|| h.snapshot().iter().map(|r| r.count).sum::<u64>() == 11).await);

    let keys: Vec<String> = server
        .handle
        .top(3)
        .into_iter()
        .map(|r| r.identity_key)
        .collect();
    assert_eq!(
        keys,
        vec![
            "SOCKET_CONNECTa.example",
            "SOCKET_CONNECTb.example",
            "SOCKET_CONNECTc.example"
        ]
    );

    drop(conn);
    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_overflow_counts_every_event() {
    let store = Arc::new(CountingStore {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let config = ServerConfig {
        queue_capacity: 1,
        overflow: IngestOverflow::Drop,
        ..Default::default()
    };
    let server = start(config, store.clone()).await;
    let factory = EventFactory::new(Uuid::new_v4());
    let events: Vec<Event> = (0..50)
        .map(|i| {
            factory.build(
                1,
                EventType::FileRead,
                None,
                Attributes::new().with("path", format!("/tmp/{}", i)),
            )
        })
        .collect();

    let mut conn = TcpStream::connect(server.addr).await.unwrap();
    conn.write_all(&frames(&events)).await.unwrap();
    let h = server.handle.clone();
    let s = store.clone();
    assert!(eventually(|| {
        let stats = h.stats();
        stats.events_received == 50
            && stats.dropped + s.written.load(Ordering::SeqCst) as u64 == 50
    })
    .await);
    assert!(server.handle.stats().dropped > 0);

    drop(conn);
    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn oversized_frame_is_a_protocol_error() {
    let config = ServerConfig {
        max_frame_len: 16,
        ..Default::default()
    };
    let server = start(config, Arc::new(CountingStore::default())).await;
    let factory = EventFactory::new(Uuid::new_v4());

    let mut conn = TcpStream::connect(server.addr).await.unwrap();
    conn.write_all(&frames(&connects(&factory, "10.0.0.3", 1))).await.unwrap();
    let h = server.handle.clone();
    assert!(eventually(|| h.stats().protocol_errors == 1).await);
    assert!(server.handle.snapshot().is_empty());

    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_open_connections() {
    let config = ServerConfig {
        drain_timeout_ms: 1000,
        ..Default::default()
    };
    let server = start(config, Arc::new(CountingStore::default())).await;
    let _idle = TcpStream::connect(server.addr).await.unwrap();
    let h = server.handle.clone();
    assert!(eventually(|| h.stats().connections_active == 1).await);

    let _ = server.stop.send(());
    tokio::time::timeout(Duration::from_secs(3), server.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.handle.stats().connections_active, 0);
    assert!(TcpStream::connect(server.addr).await.is_err());
}
