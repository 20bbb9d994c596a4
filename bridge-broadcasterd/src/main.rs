use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use bridge_broadcasterd::advertiser::Advertiser;
use bridge_broadcasterd::battery::{StaticLevel, SysfsBattery, TelemetrySource};
use bridge_broadcasterd::config::Config;
use bridge_broadcasterd::mdns::advertise::MdnsPublisher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bridge_broadcasterd=info,shared=info"))
        )
        .init();

    tracing::info!("Starting bridge-broadcasterd");

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

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let source: Box<dyn TelemetrySource> = match config.battery.fixed_level {
        Some(level) => {
            tracing::info!("Serving fixed level {}%", level);
            Box::new(StaticLevel::new(level))
        }
        None => Box::new(SysfsBattery::spawn(
            config.battery.capacity_path.clone(),
            Duration::from_secs(config.battery.poll_interval_secs.max(1)),
            cancel.clone(),
        )),
    };

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

    let publisher = MdnsPublisher::new(mdns_daemon.clone())?;
    let advertiser = Advertiser::spawn(
        identity.clone(),
        publisher,
        source.as_ref(),
        config.advertiser.settings(),
    );

    // Log consumer count and error changes
    let mut status = advertiser.status();
    let peers = advertiser.clone();
    let status_cancel = cancel.clone();
    let status_handle = tokio::spawn(async move {
        let mut shown: (usize, Option<String>) = (0, None);
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let last_error = status.borrow_and_update().last_error.clone();
                    let consumers = match peers.connected_peers().await {
                        Ok(peers) => peers.len(),
                        Err(_) => break,
                    };
                    let current = (consumers, last_error);
                    if current == shown {
                        continue;
                    }
                    match &current {
                        (_, Some(error)) => tracing::warn!("Not advertising: {}", error),
                        (0, None) => tracing::info!("Waiting for consumers"),
                        (n, None) => tracing::info!("Serving {} consumer(s)", n),
                    }
                    shown = current;
                }
                _ = status_cancel.cancelled() => break,
            }
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    if let Err(e) = advertiser.stop().await {
        tracing::error!("Failed to stop advertiser: {}", e);
    }

    // Trigger cancellation
    cancel.cancel();
    let _ = status_handle.await;

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
