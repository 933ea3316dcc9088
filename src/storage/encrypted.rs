//! SQLite-backed event store with AES-GCM encryption of the event payload.
//! Key derived from a deployment secret.

use super::EventPersistence;
use crate::error::StoreError;
use crate::event::{Attributes, Event, EventType};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

fn derive_key(seed: &[u8]) -> [u8; KEY_LEN] {
    use ring::digest;
    let mut out = [0u8; KEY_LEN];
    let h = digest::digest(&digest::SHA256, seed);
    out[..h.as_ref().len().min(KEY_LEN)].copy_from_slice(h.as_ref());
    out
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Crypto)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| StoreError::Crypto)?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(BASE64.encode(&out))
}

fn decrypt(key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>, StoreError> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| StoreError::Payload(e.to_string()))?;
    if raw.len() < NONCE_LEN {
        return Err(StoreError::Payload("payload too short".into()));
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Crypto)?;
    cipher.decrypt(nonce.into(), ct).map_err(|_| StoreError::Crypto)
}

/// Encrypted part of a stored event.
#[derive(Serialize, Deserialize)]
struct Payload {
    capture_context: Option<String>,
    attributes: Attributes,
}

/// A persisted event as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event: Event,
    pub received_at: i64,
}

pub struct EventStore {
    conn: Mutex<Connection>,
    key: [u8; KEY_LEN],
}

impl EventStore {
    /// Open or create DB at path. Key is derived from `secret`.
    pub fn open(path: &Path, secret: &[u8]) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Payload(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                origin TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                context_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload_enc TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (origin, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: derive_key(secret),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert one event; a repeated (origin, sequence) is ignored. Returns
    /// whether a row was written.
    pub fn insert_event(&self, event: &Event) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        self.insert_with(&conn, event)
    }

    fn insert_with(&self, conn: &Connection, event: &Event) -> Result<bool, StoreError> {
        let payload = serde_json::to_vec(&Payload {
            capture_context: event.capture_context.clone(),
            attributes: event.attributes.clone(),
        })
        .map_err(|e| StoreError::Payload(e.to_string()))?;
        let enc = encrypt(&self.key, &payload)?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO events (origin, sequence, ts, context_id, kind, payload_enc, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.origin.to_string(),
                event.sequence as i64,
                event.timestamp_millis,
                event.execution_context_id as i64,
                event.event_type.as_str(),
                enc,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(n > 0)
    }

    /// Read event by origin and sequence (decrypt payload)
    pub fn get_event(&self, origin: Uuid, sequence: u64) -> Result<Option<StoredEvent>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT ts, context_id, kind, payload_enc, received_at FROM events
                 WHERE origin = ?1 AND sequence = ?2",
                params![origin.to_string(), sequence as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((ts, context_id, kind, enc, received_at)) = row else {
            return Ok(None);
        };
        let plain = decrypt(&self.key, &enc)?;
        let payload: Payload =
            serde_json::from_slice(&plain).map_err(|e| StoreError::Payload(e.to_string()))?;
        let event_type: EventType = kind.parse().map_err(StoreError::Payload)?;
        Ok(Some(StoredEvent {
            event: Event {
                sequence,
                timestamp_millis: ts,
                execution_context_id: context_id as u64,
                origin,
                event_type,
                capture_context: payload.capture_context,
                attributes: payload.attributes,
            },
            received_at,
        }))
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Retention: delete events captured before the given timestamp
    pub fn prune_before(&self, ts: i64) -> Result<u64, StoreError> {
        let n = self
            .lock()?
            .execute("DELETE FROM events WHERE ts < ?1", params![ts])?;
        Ok(n as u64)
    }
}

impl EventPersistence for EventStore {
    fn persist(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for event in events {
            if self.insert_with(&tx, event)? {
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }
}
