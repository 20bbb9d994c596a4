use std::collections::HashMap;
use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use shared::protocol::TXT_NAME;
use shared::types::ServiceIdentity;

/// A live service registration.
#[derive(Debug)]
pub struct Advertisement {
    fullname: String,
    lost: CancellationToken,
    retired: CancellationToken,
}

impl Advertisement {
    pub fn new(fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
            lost: CancellationToken::new(),
            retired: CancellationToken::new(),
        }
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Fires when the responder can no longer keep the record published.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Fires once the owner withdraws the record.
    pub fn retired(&self) -> CancellationToken {
        self.retired.clone()
    }
}

/// Makes the producer discoverable on the local network.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, identity: &ServiceIdentity, port: u16) -> Result<Advertisement>;

    fn withdraw(&self, advertisement: &Advertisement) -> Result<()>;
}

/// Publisher backed by the mdns-sd responder.
pub struct MdnsPublisher {
    daemon: ServiceDaemon,
    hostname: String,
}

impl MdnsPublisher {
    pub fn new(daemon: ServiceDaemon) -> Result<Self> {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        Ok(Self { daemon, hostname })
    }
}

impl Publisher for MdnsPublisher {
    fn publish(&self, identity: &ServiceIdentity, port: u16) -> Result<Advertisement> {
        let service_type = identity.qualified_type();
        let instance_name = format!("{}-{}", identity.name, self.hostname);
        let host_name = format!("{}.{}.", self.hostname, identity.domain.trim_end_matches('.'));

        let txt_records = HashMap::from([
            (TXT_NAME.to_string(), identity.name.clone()),
        ]);

        let service_info = ServiceInfo::new(
            &service_type,
            &instance_name,
            &host_name,
            "",
            port,
            txt_records,
        )
        .context("Failed to create ServiceInfo")?
        .enable_addr_auto();

        let monitor = self
            .daemon
            .monitor()
            .context("Failed to monitor mDNS daemon")?;

        self.daemon
            .register(service_info.clone())
            .context("Failed to register mDNS service")?;

        tracing::info!(
            "Registered {} as {} on port {}",
            service_type,
            instance_name,
            port
        );

        let advertisement = Advertisement::new(service_info.get_fullname());
        tokio::spawn(watch_daemon(monitor, advertisement.lost(), advertisement.retired()));

        Ok(advertisement)
    }

    fn withdraw(&self, advertisement: &Advertisement) -> Result<()> {
        advertisement.retired.cancel();

        self.daemon
            .unregister(advertisement.fullname())
            .context("Failed to unregister mDNS service")?;

        tracing::info!("Unregistered {}", advertisement.fullname());
        Ok(())
    }
}

/// Marks the advertisement lost when the responder goes away. Responder
/// errors on individual interfaces are only logged.
async fn watch_daemon(
    monitor: flume::Receiver<DaemonEvent>,
    lost: CancellationToken,
    retired: CancellationToken,
) {
    loop {
        tokio::select! {
            event = monitor.recv_async() => match event {
                Ok(DaemonEvent::Error(e)) => {
                    tracing::warn!("mDNS responder error: {}", e);
                }
                Ok(event) => {
                    tracing::trace!("mDNS responder event: {:?}", event);
                }
                Err(e) => {
                    tracing::error!("mDNS responder stopped: {}", e);
                    lost.cancel();
                    break;
                }
            },
            _ = retired.cancelled() => break,
        }
    }
}
