//! tandem - demo host
//!
//! Serves a small set of operations over tandem connections on TCP.

mod config;
mod demo;
mod host;

use config::Config;
use host::Host;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("TANDEM_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    let registry = Arc::new(demo::registry()?);

    tracing::info!("Starting tandem host");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Max message size: {} bytes",
        config.connection.max_message_size
    );
    match config.connection.request_timeout() {
        Some(timeout) => tracing::info!("  Request timeout: {:?}", timeout),
        None => tracing::info!("  Request timeout: none"),
    }
    for op in registry.descriptors() {
        tracing::info!("  Operation: {} ({:?})", op.name, op.kind);
    }

    let host = Arc::new(Host::new(
        config.network.max_connections,
        config.connection.clone(),
        registry,
    ));

    // Spawn shutdown signal handler
    let shutdown_host = host.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping host...");
        shutdown_host.shutdown();
    });

    host.run(config.network.bind_addr).await?;

    let stats = host.stats();
    tracing::info!(
        "Host stopped ({} connections served, {} rejected, {} errors)",
        stats.connections_total.load(Ordering::Relaxed),
        stats.connections_rejected.load(Ordering::Relaxed),
        stats.errors_total.load(Ordering::Relaxed)
    );
    Ok(())
}
