//! Watchpost ingestion server entrypoint: receives event streams from
//! monitored processes, keeps live aggregates, persists to the encrypted store.
//! Stops on Ctrl+C or the console `quit` command.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use watchpost::{
    aggregate::AggregateRecord,
    config::{LogConfig, ServerConfig},
    console::{Command, CommandChannel, CommandListener},
    error::ServerError,
    logging::StructuredLogger,
    server::{IngestionServer, ServerHandle, ServerStatsSnapshot},
    storage::EventStore,
};

const DEV_SECRET: &[u8] = b"watchpost-development-secret";

#[derive(Serialize)]
struct StatusReport<'a> {
    stats: ServerStatsSnapshot,
    evicted: u64,
    top: &'a [AggregateRecord],
}

/// Console commands for operators.
struct ServerConsole {
    handle: ServerHandle,
    quit: watch::Sender<bool>,
}

impl ServerConsole {
    fn print(&self, kind: &str, value: &impl Serialize) {
        StructuredLogger::emit_json(kind, value, &mut std::io::stdout().lock());
    }
}

impl CommandListener for ServerConsole {
    fn on_command(&mut self, command: &Command) {
        match command.name.as_str() {
            "status" => {
                let top = self.handle.top(10);
                self.print("status", &StatusReport {
                    stats: self.handle.stats(),
                    evicted: self.handle.evicted(),
                    top: &top,
                });
            }
            "top" => {
                let n = command
                    .args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(10);
                self.print("top", &self.handle.top(n));
            }
            "drops" => {
                let stats = self.handle.stats();
                self.print("drops", &serde_json::json!({
                    "dropped": stats.dropped,
                    "duplicates": stats.duplicates,
                    "rejected_connections": stats.rejected_connections,
                    "protocol_errors": stats.protocol_errors,
                    "idle_closed": stats.idle_closed,
                    "persist_failures": stats.persist_failures,
                }));
            }
            "quit" | "exit" => {
                let _ = self.quit.send(true);
            }
            "help" => println!("commands: status | top [n] | drops | quit"),
            other => println!("unknown command {:?}; try help", other),
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let secret = std::env::var("WATCHPOST_STORE_SECRET")
        .ok()
        .or_else(|| config.store_secret.clone())
        .map(String::into_bytes)
        .unwrap_or_else(|| {
            warn!("no store secret configured; using the development secret");
            DEV_SECRET.to_vec()
        });
    let store = Arc::new(EventStore::open(&config.store_path, &secret)?);
    info!(store = ?config.store_path, "event store open");

    let server = IngestionServer::bind(config, store).await?;
    let (quit_tx, mut quit_rx) = watch::channel(false);

    let mut channel = CommandChannel::new();
    channel.add_listener(Box::new(ServerConsole {
        handle: server.handle(),
        quit: quit_tx,
    }));
    let console_stop = channel.shutdown_flag();
    let console = std::thread::Builder::new()
        .name("watchpost-console".into())
        .spawn(move || channel.run(std::io::stdin().lock()));
    if let Err(e) = &console {
        warn!(error = %e, "console unavailable");
    }

    server
        .run(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = quit_rx.changed() => info!("quit requested"),
            }
        })
        .await;
    console_stop.store(true, std::sync::atomic::Ordering::Relaxed);
    Ok(())
}

#[tokio::main]
async fn main() {
    let config_path = std::env::var("WATCHPOST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("watchpost.json"));
    let config = match ServerConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            StructuredLogger::init(&LogConfig::default());
            let e = ServerError::from(e);
            error!(error = %e, "invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    StructuredLogger::init(&config.log);
    info!(config = ?config_path, "watchpost ingestion server starting");

    if let Err(e) = serve(config).await {
        error!(error = %e, "ingestion server failed");
        std::process::exit(e.exit_code());
    }
}
