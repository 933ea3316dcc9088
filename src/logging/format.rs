//! Log output: tracing to stderr (JSON lines or human readable), and ndjson
//! records on stdout for operator console replies.

use crate::config::LogConfig;
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// One console reply line: `{"ts":..,"kind":"status","data":{..}}`.
#[derive(Serialize)]
struct ConsoleRecord<'a, T: Serialize> {
    ts: String,
    kind: &'a str,
    data: &'a T,
}

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber. `RUST_LOG` overrides the configured
    /// level. A second call is a no-op.
    pub fn init(config: &LogConfig) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
        let registry = tracing_subscriber::registry().with(filter);
        let result = if config.json {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_thread_names(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_thread_names(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }

    /// Write one console record. Write failures are ignored; the console is
    /// best effort.
    pub fn emit_json(kind: &str, data: &impl Serialize, w: &mut impl Write) {
        let record = ConsoleRecord {
            ts: Utc::now().to_rfc3339(),
            kind,
            data,
        };
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(w, "{}", line);
        }
    }
}
