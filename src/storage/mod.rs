//! Persistence collaborator for the ingestion server.

mod encrypted;

pub use encrypted::{EventStore, StoredEvent};

use crate::error::StoreError;
use crate::event::Event;

/// Append-only event persistence shared by all connections. Implementations
/// serialize concurrent writers themselves.
pub trait EventPersistence: Send + Sync {
    /// Persist a batch in order. Returns how many were new.
    fn persist(&self, events: &[Event]) -> Result<usize, StoreError>;
}
