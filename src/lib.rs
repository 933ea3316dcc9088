//! Watchpost - runtime security-observability agent and ingestion server.
//!
//! Modular structure:
//! - [`guard`] - Per-execution-context reentrancy guard
//! - [`sensors`] - Sensors, transforms and built-in interceptors
//! - [`instrument`] - Instrumentation capability, guarded hooks, interceptor registry
//! - [`pipeline`] - Bounded event buffer, dispatcher thread, sinks
//! - [`frame`] - Event wire frames
//! - [`server`] - TCP ingestion server
//! - [`aggregate`] - Frequency-ranked event aggregator
//! - [`storage`] - Encrypted event store
//! - [`console`] - Interactive command channel
//! - [`logging`] - Structured JSON logging

pub mod agent;
pub mod aggregate;
pub mod config;
pub mod console;
pub mod error;
pub mod event;
pub mod frame;
pub mod guard;
pub mod instrument;
pub mod logging;
pub mod pipeline;
pub mod sensors;
pub mod server;
pub mod storage;

pub use agent::Agent;
pub use aggregate::{AggregateRecord, Aggregator};
pub use config::{AgentConfig, OverflowStrategy, ServerConfig, SensorOptions};
pub use console::{Command, CommandChannel, CommandListener};
pub use event::{Attributes, Event, EventFactory, EventType, ProcessIdentity};
pub use guard::ExecutionContext;
pub use instrument::{HookTable, InstrumentationCapability, InterceptorRegistry};
pub use logging::StructuredLogger;
pub use pipeline::{EventBuffer, EventSink, TcpSink};
pub use server::{IngestionServer, ServerHandle};
pub use storage::{EventPersistence, EventStore};
