// mikrotik-manager: Fan-out API proxy and durable command dispatcher for a
// fleet of MikroTik routers.

use mikrotik_manager::config::{ConfigStore, DATABASE_URL_KEY, DEFAULT_CONFIG_DB};
use mikrotik_manager::processor::QueueProcessor;
use mikrotik_manager::queue::CommandQueue;
use mikrotik_manager::status::{StatusKey, StatusMap};
use mikrotik_manager::supervisor::DeviceSupervisor;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    // Structured logging to stdout; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "mikrotik-manager starting"
    );

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_DB.to_owned());
    let store = match ConfigStore::open(Path::new(&config_path)) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("FATAL: failed to open config store '{}': {}", config_path, e);
            std::process::exit(1);
        }
    };

    let dsn = match store.service_value(DATABASE_URL_KEY) {
        Ok(Some(dsn)) => dsn,
        Ok(None) => {
            eprintln!(
                "FATAL: service_config has no '{}' entry; the durable queue needs one",
                DATABASE_URL_KEY
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("FATAL: failed to read service_config: {}", e);
            std::process::exit(1);
        }
    };

    let devices = match store.list_enabled_devices() {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("FATAL: failed to list devices: {}", e);
            std::process::exit(1);
        }
    };
    info!(devices = devices.len(), "config loaded");

    let status = StatusMap::new();
    let queue = match CommandQueue::connect(&dsn).await {
        Ok(queue) => {
            status.set(StatusKey::Database, "Connected").await;
            Arc::new(queue)
        }
        Err(e) => {
            eprintln!("FATAL: durable store unavailable: {}", e);
            std::process::exit(1);
        }
    };

    let supervisor = DeviceSupervisor::new(Arc::clone(&queue), status.clone());
    supervisor.start_all(devices).await;

    let processor = QueueProcessor::new(Arc::clone(&queue), supervisor.sessions(), status.clone());
    let processor_handle = tokio::spawn(processor.run());
    status.set(StatusKey::Processor, "Started").await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: failed to listen for shutdown signal: {}", e);
        std::process::exit(1);
    }
    info!("shutting down");
    processor_handle.abort();
    supervisor.stop_all().await;
}
