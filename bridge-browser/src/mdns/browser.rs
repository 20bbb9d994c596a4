use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use shared::types::{DiscoveryResult, ServiceIdentity};

/// What a running scan reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Ready,
    /// Transient condition, e.g. no usable interface yet
    Waiting(String),
    Failed(String),
    /// The full set of announced endpoints after a change, sorted by
    /// instance name
    Results(Vec<DiscoveryResult>),
}

/// A running scan. Dropping it stops the scan.
#[derive(Debug)]
pub struct ScanHandle {
    events: mpsc::UnboundedReceiver<ScanEvent>,
    cancel: CancellationToken,
}

impl ScanHandle {
    pub fn new(events: mpsc::UnboundedReceiver<ScanEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event; `None` once the scanner has stopped on its own
    pub async fn next(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Continuously looks for producers announcing the service identity.
pub trait Scanner: Send + Sync + 'static {
    fn scan(&self, identity: &ServiceIdentity) -> Result<ScanHandle>;
}

/// Scanner backed by the mdns-sd responder.
pub struct MdnsScanner {
    daemon: ServiceDaemon,
}

impl MdnsScanner {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self { daemon }
    }
}

impl Scanner for MdnsScanner {
    fn scan(&self, identity: &ServiceIdentity) -> Result<ScanHandle> {
        let service_type = identity.qualified_type();
        let receiver = self
            .daemon
            .browse(&service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;

        tracing::info!("Browsing for {}", service_type);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_browser(
            self.daemon.clone(),
            service_type,
            receiver,
            tx,
            cancel.clone(),
        ));

        Ok(ScanHandle::new(rx, cancel))
    }
}

async fn run_browser(
    daemon: ServiceDaemon,
    service_type: String,
    receiver: flume::Receiver<ServiceEvent>,
    tx: mpsc::UnboundedSender<ScanEvent>,
    cancel: CancellationToken,
) {
    let mut state = BrowseState::default();

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                let Some(update) = state.apply(event) else {
                    continue;
                };
                let failed = matches!(update, ScanEvent::Failed(_));
                if tx.send(update).is_err() || failed {
                    break;
                }
            }

            _ = cancel.cancelled() => {
                tracing::debug!("Stopping browse for {}", service_type);
                if let Err(e) = daemon.stop_browse(&service_type) {
                    tracing::debug!("Failed to stop browse: {}", e);
                }
                break;
            }
        }
    }
}

/// Resolved instances seen so far by one browse
#[derive(Debug, Default)]
struct BrowseState {
    found: BTreeMap<String, SocketAddr>,
    ready: bool,
}

impl BrowseState {
    /// Fold one responder event into the state. Returns the scan event to
    /// report, if the event changed anything the owner cares about.
    fn apply(&mut self, event: Result<ServiceEvent, flume::RecvError>) -> Option<ScanEvent> {
        match event {
            Ok(ServiceEvent::SearchStarted(_)) if !self.ready => {
                self.ready = true;
                Some(ScanEvent::Ready)
            }
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let Some(endpoint) = endpoint_of(&info) else {
                    tracing::debug!("Skipping {} - no addresses", info.get_fullname());
                    return None;
                };
                let fullname = info.get_fullname().to_string();
                tracing::debug!("Resolved {} at {}", fullname, endpoint);
                if self.found.insert(fullname, endpoint) == Some(endpoint) {
                    return None;
                }
                Some(ScanEvent::Results(snapshot(&self.found)))
            }
            Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                tracing::debug!("Service removed: {}", fullname);
                self.found
                    .remove(&fullname)
                    .map(|_| ScanEvent::Results(snapshot(&self.found)))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("mDNS browse channel closed: {}", e);
                Some(ScanEvent::Failed(format!("mDNS browse stopped: {}", e)))
            }
        }
    }
}

fn snapshot(found: &BTreeMap<String, SocketAddr>) -> Vec<DiscoveryResult> {
    found
        .iter()
        .map(|(instance_name, endpoint)| DiscoveryResult {
            instance_name: instance_name.clone(),
            endpoint: *endpoint,
        })
        .collect()
}

/// Pick one address for a resolved instance: IPv4 first, then the smallest.
fn endpoint_of(info: &ServiceInfo) -> Option<SocketAddr> {
    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    pick_address(&addresses).map(|ip| SocketAddr::new(ip, info.get_port()))
}

fn pick_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .copied()
        .min_by_key(|addr| (addr.is_ipv6(), *addr))
}
