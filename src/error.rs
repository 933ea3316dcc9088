//! Error taxonomy. Observation-side failures are absorbed where they happen;
//! only server startup failures reach the process exit code.

use std::io;
use thiserror::Error;

/// Invalid or missing configuration at sensor, pipeline or server startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid value {value:?} for option {key}: expected {expected}")]
    InvalidOption {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("sensor {0:?} is already registered")]
    DuplicateSensor(String),

    #[error("sensor name must not be empty")]
    EmptySensorName,

    #[error("target operation {0} cannot be resolved")]
    UnresolvedTarget(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Failure inside interceptor logic. Never reaches the monitored operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptorFault {
    #[error("missing argument {0}")]
    MissingArgument(&'static str),

    #[error("interceptor panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Malformed or stalled input on an ingestion connection. Terminates that
/// connection only.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max: {max_size})")]
    TooLarge { size: usize, max_size: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("CRC32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    #[error("unsupported record version {0:?}")]
    UnsupportedVersion(String),

    #[error("peer closed mid-frame")]
    Truncated,

    #[error("timeout waiting for frame body")]
    Timeout,

    #[error("no frame within the idle timeout")]
    Idle,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Sink unreachable or write failed. Triggers bounded retry in the dispatcher.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("write failed: {0}")]
    Write(#[from] io::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Persistence failure in the event store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("encryption error")]
    Crypto,

    #[error("payload decode error: {0}")]
    Payload(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Fatal ingestion server startup failure.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServerError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Bind { .. } => 2,
            ServerError::Configuration(_) => 3,
            ServerError::Store(_) => 4,
        }
    }
}
