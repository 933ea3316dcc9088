//! Agent and server configuration.
//!
//! Sensors and the local pipeline read a flat `<namespace>.<option>` map
//! ([`SensorOptions`]); unset options take the documented defaults. The server
//! has a typed config loaded from JSON.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flat sensor/pipeline option map, e.g. `"file.enabled": false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, serde_json::Value>", into = "BTreeMap<String, String>")]
pub struct SensorOptions(BTreeMap<String, String>);

impl From<BTreeMap<String, serde_json::Value>> for SensorOptions {
    fn from(raw: BTreeMap<String, serde_json::Value>) -> Self {
        let map = raw
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect();
        Self(map)
    }
}

impl From<SensorOptions> for BTreeMap<String, String> {
    fn from(options: SensorOptions) -> Self {
        options.0
    }
}

impl SensorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.trim())
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigurationError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(invalid(key, v, "a boolean")),
            },
        }
    }

    pub fn u64(&self, key: &str, default: u64) -> Result<u64, ConfigurationError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| invalid(key, v, "a non-negative integer")),
        }
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    /// Comma separated list; empty items are skipped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.raw(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigurationError> {
        match self.raw(key) {
            None => Ok(default),
            Some(_) => self.u64(key, 0).map(Duration::from_millis),
        }
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigurationError {
    ConfigurationError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

/// What a full local buffer does with the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowStrategy {
    /// Block the producer until space frees, up to the wait timeout.
    Wait,
    /// Discard the incoming event.
    DropNewest,
    /// Evict the head of the buffer to admit the incoming event.
    DropOldest,
    /// Return failure to the caller immediately.
    Reject,
}

impl OverflowStrategy {
    pub fn parse(key: &str, value: &str) -> Result<Self, ConfigurationError> {
        match value {
            "wait" => Ok(OverflowStrategy::Wait),
            "dropNewest" => Ok(OverflowStrategy::DropNewest),
            "dropOldest" => Ok(OverflowStrategy::DropOldest),
            "reject" => Ok(OverflowStrategy::Reject),
            _ => Err(invalid(key, value, "one of wait|dropNewest|dropOldest|reject")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub overflow: OverflowStrategy,
    pub wait_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub shutdown_grace: Duration,
    pub report_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            batch_size: 128,
            flush_interval: Duration::from_millis(500),
            overflow: OverflowStrategy::DropOldest,
            wait_timeout: Duration::from_millis(50),
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(2000),
            report_interval: Duration::from_millis(30_000),
        }
    }
}

impl PipelineConfig {
    pub fn from_options(options: &SensorOptions) -> Result<Self, ConfigurationError> {
        let d = Self::default();
        let capacity = options.u64("pipeline.capacity", d.capacity as u64)?;
        if capacity == 0 {
            return Err(invalid("pipeline.capacity", "0", "a positive integer"));
        }
        let batch_size = options.u64("pipeline.batch_size", d.batch_size as u64)?;
        if batch_size == 0 {
            return Err(invalid("pipeline.batch_size", "0", "a positive integer"));
        }
        let overflow = match options.raw("pipeline.overflow") {
            Some(v) => OverflowStrategy::parse("pipeline.overflow", v)?,
            None => d.overflow,
        };
        let max_retries = options.u64("pipeline.max_retries", d.max_retries as u64)?;
        Ok(Self {
            capacity: capacity as usize,
            batch_size: batch_size as usize,
            flush_interval: options.millis("pipeline.flush_interval_ms", d.flush_interval)?,
            overflow,
            wait_timeout: options.millis("pipeline.wait_timeout_ms", d.wait_timeout)?,
            max_retries: u32::try_from(max_retries).unwrap_or(u32::MAX),
            retry_backoff: options.millis("pipeline.retry_backoff_ms", d.retry_backoff)?,
            shutdown_grace: options.millis("pipeline.shutdown_grace_ms", d.shutdown_grace)?,
            report_interval: options.millis("pipeline.report_interval_ms", d.report_interval)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub address: String,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Reconnect instead of reusing a connection unused for this long. Keep it
    /// below the server's read idle timeout.
    pub idle_timeout: Duration,
}

impl SinkConfig {
    pub fn from_options(options: &SensorOptions) -> Result<Self, ConfigurationError> {
        Ok(Self {
            address: options.string("sink.address", "127.0.0.1:9876"),
            connect_timeout: options.millis("sink.connect_timeout_ms", Duration::from_secs(2))?,
            write_timeout: options.millis("sink.write_timeout_ms", Duration::from_secs(5))?,
            idle_timeout: options.millis("sink.idle_timeout_ms", Duration::from_secs(60))?,
        })
    }
}

/// Monitored-process side configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// `<namespace>.<option>` values for sensors, pipeline and sink
    #[serde(default)]
    pub options: SensorOptions,
    #[serde(default)]
    pub log: LogConfig,
}

impl AgentConfig {
    /// Load from JSON file if present and valid; otherwise return default
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                if let Ok(c) = serde_json::from_str::<AgentConfig>(&data) {
                    return c;
                }
            }
            tracing::warn!(path = %path.display(), "agent config unreadable; using defaults");
        }
        Self::default()
    }

    /// Path from `WATCHPOST_AGENT_CONFIG`, else `watchpost-agent.json`.
    pub fn from_env() -> Self {
        let path = std::env::var_os("WATCHPOST_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("watchpost-agent.json"));
        Self::load(&path)
    }

    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigurationError> {
        PipelineConfig::from_options(&self.options)
    }

    pub fn sink(&self) -> Result<SinkConfig, ConfigurationError> {
        SinkConfig::from_options(&self.options)
    }
}

/// What a full per-connection ingest queue does with the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOverflow {
    /// Stop reading the socket until space frees, up to the enqueue timeout; then drop.
    Wait,
    /// Discard the incoming event and count it.
    Drop,
    /// Close the connection; the sender retries later.
    Reject,
}

/// Ingestion server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Bounded queue between a connection's reader and its persistence stage
    pub queue_capacity: usize,
    pub overflow: IngestOverflow,
    pub enqueue_timeout_ms: u64,
    pub max_frame_len: usize,
    /// Connections idle longer than this are closed
    pub read_idle_timeout_secs: u64,
    pub drain_timeout_ms: u64,
    /// Aggregate record cap; least frequent records are evicted beyond it
    pub aggregator_max_records: usize,
    pub status_interval_secs: u64,
    pub store_path: PathBuf,
    /// Store encryption secret; `WATCHPOST_STORE_SECRET` overrides
    pub store_secret: Option<String>,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let store_path = dirs::data_local_dir()
            .map(|d| d.join("watchpost").join("events.db"))
            .unwrap_or_else(|| PathBuf::from(".watchpost/events.db"));
        Self {
            listen_addr: "0.0.0.0:9876".to_string(),
            queue_capacity: 1024,
            overflow: IngestOverflow::Wait,
            enqueue_timeout_ms: 1000,
            max_frame_len: 1024 * 1024,
            read_idle_timeout_secs: 300,
            drain_timeout_ms: 5000,
            aggregator_max_records: 10_000,
            status_interval_secs: 60,
            store_path,
            store_secret: None,
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from JSON file if present; otherwise return default. A present but
    /// invalid file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file_err = |reason: String| ConfigurationError::File {
            path: path.display().to_string(),
            reason,
        };
        let data = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        serde_json::from_str(&data).map_err(|e| file_err(e.to_string()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigurationError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigurationError::InvalidAddress(self.listen_addr.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.listen_addr()?;
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "0", "a positive integer"));
        }
        if self.max_frame_len == 0 {
            return Err(invalid("max_frame_len", "0", "a positive integer"));
        }
        if self.aggregator_max_records == 0 {
            return Err(invalid("aggregator_max_records", "0", "a positive integer"));
        }
        Ok(())
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}
