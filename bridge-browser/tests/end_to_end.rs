//! A real advertiser and a real discoverer talking over loopback. Service
//! discovery is replaced by in-memory doubles; everything from the listener
//! to the decoded value is the production path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use bridge_broadcasterd::advertiser::{Advertiser, AdvertiserHandle, AdvertiserSettings};
use bridge_broadcasterd::battery::StaticLevel;
use bridge_broadcasterd::mdns::advertise::{Advertisement, Publisher};
use bridge_browser::discoverer::{Discoverer, DiscovererHandle, DiscovererSettings};
use bridge_browser::mdns::browser::{ScanEvent, ScanHandle, Scanner};
use shared::retry::RetryPolicy;
use shared::status::LinkStatus;
use shared::types::{DiscoveryResult, ServiceIdentity, TelemetryValue};

const WAIT: Duration = Duration::from_secs(5);

/// Publisher that records the published instance name and does nothing else.
#[derive(Clone, Default)]
struct LoopbackPublisher {
    published: Arc<Mutex<Vec<String>>>,
}

impl Publisher for LoopbackPublisher {
    fn publish(&self, identity: &ServiceIdentity, port: u16) -> Result<Advertisement> {
        let fullname = format!("{}-{}.{}", identity.name, port, identity.qualified_type());
        self.published.lock().unwrap().push(fullname.clone());
        Ok(Advertisement::new(fullname))
    }

    fn withdraw(&self, _advertisement: &Advertisement) -> Result<()> {
        Ok(())
    }
}

/// Scanner that immediately finds one fixed endpoint.
struct FixedScanner {
    result: DiscoveryResult,
    // keeps scans open until the discoverer cancels them
    open: Mutex<Vec<mpsc::UnboundedSender<ScanEvent>>>,
}

impl FixedScanner {
    fn new(instance_name: &str, endpoint: SocketAddr) -> Self {
        Self {
            result: DiscoveryResult {
                instance_name: instance_name.to_string(),
                endpoint,
            },
            open: Mutex::new(Vec::new()),
        }
    }
}

impl Scanner for FixedScanner {
    fn scan(&self, _identity: &ServiceIdentity) -> Result<ScanHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ScanEvent::Ready)?;
        tx.send(ScanEvent::Results(vec![self.result.clone()]))?;
        self.open.lock().unwrap().push(tx);
        Ok(ScanHandle::new(rx, CancellationToken::new()))
    }
}

fn percent(value: u8) -> TelemetryValue {
    TelemetryValue::new(value).unwrap()
}

fn identity() -> Arc<ServiceIdentity> {
    Arc::new(ServiceIdentity {
        port: 0,
        ..ServiceIdentity::default()
    })
}

async fn wait_for(
    mut status: tokio::sync::watch::Receiver<LinkStatus>,
    what: &str,
    mut f: impl FnMut(&LinkStatus) -> bool,
) -> LinkStatus {
    let snapshot = tokio::time::timeout(WAIT, status.wait_for(|s| f(s)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("status sender dropped")
        .clone();
    snapshot
}

async fn start_pair(level: &StaticLevel) -> (AdvertiserHandle, DiscovererHandle) {
    let advertiser = Advertiser::spawn(
        identity(),
        LoopbackPublisher::default(),
        level,
        AdvertiserSettings {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            // keep periodic pushes out of the way
            broadcast_interval: Duration::from_secs(60),
            retry: RetryPolicy::fixed(Duration::from_millis(200)),
        },
    );

    let addr = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(addr) = advertiser.local_addr().await.unwrap() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("advertiser never started listening");

    let discoverer = Discoverer::spawn(
        identity(),
        FixedScanner::new("BatteryBridge-test", addr),
        DiscovererSettings {
            rescan: RetryPolicy::fixed(Duration::from_millis(200)),
            reconnect: RetryPolicy::fixed(Duration::from_millis(200)),
        },
    );

    (advertiser, discoverer)
}

#[tokio::test]
async fn test_consumer_receives_current_value_on_connect() {
    let level = StaticLevel::new(percent(42));
    let (advertiser, discoverer) = start_pair(&level).await;

    let status = wait_for(discoverer.status(), "first value", |s| s.value.is_some()).await;
    assert!(status.connected);
    assert_eq!(status.value, Some(percent(42)));
    assert!(status.updated_at.is_some());

    wait_for(advertiser.status(), "producer connected", |s| s.connected).await;
    assert_eq!(advertiser.connected_peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_value_changes_reach_consumer() {
    let level = StaticLevel::new(percent(100));
    let (_advertiser, discoverer) = start_pair(&level).await;

    wait_for(discoverer.status(), "initial value", |s| s.value == Some(percent(100))).await;

    for value in [0, 1, 50, 99, 100] {
        level.set(percent(value));
        wait_for(discoverer.status(), &format!("{}%", value), |s| {
            s.value == Some(percent(value))
        })
        .await;
    }
}

#[tokio::test]
async fn test_producer_stop_disconnects_consumer_and_keeps_value() {
    let level = StaticLevel::new(percent(63));
    let (advertiser, discoverer) = start_pair(&level).await;

    wait_for(discoverer.status(), "connected", |s| s.connected && s.value == Some(percent(63))).await;

    advertiser.stop().await.unwrap();

    let status = wait_for(discoverer.status(), "disconnect", |s| !s.connected).await;
    assert_eq!(status.value, Some(percent(63)));
    assert!(status.last_error.is_some());
    assert_eq!(discoverer.active_endpoint().await.unwrap(), None);
}

#[tokio::test]
async fn test_consumer_stop_empties_connection_set() {
    let level = StaticLevel::new(percent(10));
    let (advertiser, discoverer) = start_pair(&level).await;

    wait_for(advertiser.status(), "producer connected", |s| s.connected).await;

    discoverer.stop().await.unwrap();

    wait_for(advertiser.status(), "producer idle", |s| !s.connected).await;
    assert!(advertiser.connected_peers().await.unwrap().is_empty());
}
