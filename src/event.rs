//! Unified event model shared by the capture side and the ingestion server.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use uuid::Uuid;

/// Kind of observed operation. The wire name is the SCREAMING_SNAKE form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    FileRead,
    FileWrite,
    FileDelete,
    SocketConnect,
    SocketBind,
    ClassloaderCreate,
    Permission,
    ApiCall,
    SystemProperty,
    Environment,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::FileRead,
        EventType::FileWrite,
        EventType::FileDelete,
        EventType::SocketConnect,
        EventType::SocketBind,
        EventType::ClassloaderCreate,
        EventType::Permission,
        EventType::ApiCall,
        EventType::SystemProperty,
        EventType::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileRead => "FILE_READ",
            EventType::FileWrite => "FILE_WRITE",
            EventType::FileDelete => "FILE_DELETE",
            EventType::SocketConnect => "SOCKET_CONNECT",
            EventType::SocketBind => "SOCKET_BIND",
            EventType::ClassloaderCreate => "CLASSLOADER_CREATE",
            EventType::Permission => "PERMISSION",
            EventType::ApiCall => "API_CALL",
            EventType::SystemProperty => "SYSTEM_PROPERTY",
            EventType::Environment => "ENVIRONMENT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Insertion-ordered string attributes. The first entry is the primary attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn first_value(&self) -> Option<&str> {
        self.0.first().map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One observed operation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp_millis: i64,
    pub execution_context_id: u64,
    pub origin: Uuid,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_context: Option<String>,
    pub attributes: Attributes,
}

impl Event {
    /// Aggregation key: event type name followed by the primary attribute value.
    pub fn identity_key(&self) -> String {
        match self.attributes.first_value() {
            Some(v) => format!("{}{}", self.event_type.as_str(), v),
            None => self.event_type.as_str().to_string(),
        }
    }
}

/// The GUID of this process instance, generated once and stable for its lifetime.
pub struct ProcessIdentity;

impl ProcessIdentity {
    pub fn get() -> Uuid {
        static ID: OnceLock<Uuid> = OnceLock::new();
        *ID.get_or_init(Uuid::new_v4)
    }
}

/// Builds events for one origin, stamping strictly increasing sequence numbers.
pub struct EventFactory {
    origin: Uuid,
    next_sequence: AtomicU64,
}

impl EventFactory {
    pub fn new(origin: Uuid) -> Self {
        Self {
            origin,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn for_process() -> Self {
        Self::new(ProcessIdentity::get())
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn build(
        &self,
        execution_context_id: u64,
        event_type: EventType,
        capture_context: Option<String>,
        attributes: Attributes,
    ) -> Event {
        Event {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            timestamp_millis: Utc::now().timestamp_millis(),
            execution_context_id,
            origin: self.origin,
            event_type,
            capture_context,
            attributes,
        }
    }
}
