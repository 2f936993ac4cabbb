use anyhow::Result;
use std::sync::Arc;

use multiproxy_node::config::{CliArgs, ConnConfig};
use multiproxy_node::logger::{self, log};
use multiproxy_node::storage::JsonFileStorage;
use multiproxy_node::{ProxyManager, TrafficCollector};

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_mode);

    log::info!(
        data_dir = %cli.data_dir.display(),
        listen_host = %cli.listen_host,
        "Starting proxy node"
    );

    let storage = Arc::new(JsonFileStorage::open(&cli.data_dir).await?);
    let conn_config = ConnConfig::from_cli(&cli);
    let manager = Arc::new(ProxyManager::new(storage, conn_config));

    manager.restore().await?;

    let collector = TrafficCollector::new(cli.collect_interval, Arc::clone(&manager)).start();

    shutdown_signal().await?;

    // Flush counters before the listeners go away
    collector.shutdown().await;
    manager.shutdown().await;

    log::info!("Proxy node stopped");
    Ok(())
}
