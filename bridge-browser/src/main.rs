use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use bridge_browser::config::Config;
use bridge_browser::discoverer::Discoverer;
use bridge_browser::mdns::browser::MdnsScanner;
use bridge_browser::presenter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bridge_browser=info,shared=info"))
        )
        .init();

    tracing::info!("Starting bridge-browser");

    // Load config
    let config = match std::env::args().nth(1) {
        Some(config_path) => {
            let config = Config::load(&config_path)
                .with_context(|| format!("Failed to load config from {}", config_path))?;
            tracing::info!("Loaded config from {}", config_path);
            config
        }
        None => Config::default(),
    };

    let identity = Arc::new(config.service.clone());
    let cancel = CancellationToken::new();

    // Create mDNS daemon, optionally bound to one interface
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.mdns.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let discoverer = Discoverer::spawn(
        identity,
        MdnsScanner::new(mdns_daemon.clone()),
        config.discovery.settings(),
    );

    let presenter_handle = tokio::spawn(presenter::run(discoverer.status(), cancel.clone()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    if let Err(e) = discoverer.stop().await {
        tracing::error!("Failed to stop discoverer: {}", e);
    }

    cancel.cancel();
    let _ = presenter_handle.await;

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
