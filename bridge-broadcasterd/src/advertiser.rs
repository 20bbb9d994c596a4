//! Producer side of the link.
//!
//! The advertiser is an actor: one task owns the listener, the pending and
//! live consumer sessions, and the status board. Accept-loop results,
//! session transitions, retry timers, the broadcast ticker and telemetry
//! changes are all delivered to that task, so the connection set is only
//! ever touched from one place.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::protocol::BROADCAST_INTERVAL;
use shared::retry::RetryPolicy;
use shared::session::{SessionEvent, SessionId, SessionState, TransportSession};
use shared::status::{LinkStatus, StatusBoard};
use shared::types::{ServiceIdentity, TelemetryValue};
use shared::wire;
use crate::battery::TelemetrySource;
use crate::connections::ConnectionSet;
use crate::mdns::advertise::{Advertisement, Publisher};

#[derive(Debug, Clone)]
pub struct AdvertiserSettings {
    /// Local address the listener binds to; the port comes from the identity
    pub bind: IpAddr,
    pub broadcast_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for AdvertiserSettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_interval: BROADCAST_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Commands sent to the advertiser task
pub enum AdvertiserCommand {
    LocalAddr(oneshot::Sender<Option<SocketAddr>>),
    ConnectedPeers(oneshot::Sender<Vec<SocketAddr>>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running advertiser
#[derive(Clone)]
pub struct AdvertiserHandle {
    tx: mpsc::Sender<AdvertiserCommand>,
    status: watch::Receiver<LinkStatus>,
}

impl AdvertiserHandle {
    /// Connection state, last error and the value being served
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Address the current listener is bound to, if one is up
    pub async fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        self.send(AdvertiserCommand::LocalAddr(reply)).await?;
        Ok(rx.await?)
    }

    /// Peers of the live consumer sessions, in acceptance order
    pub async fn connected_peers(&self) -> Result<Vec<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        self.send(AdvertiserCommand::ConnectedPeers(reply)).await?;
        Ok(rx.await?)
    }

    /// Withdraw the advertisement, close the listener and every session,
    /// and unsubscribe from the telemetry source.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(AdvertiserCommand::Stop(reply)).await?;
        Ok(rx.await?)
    }

    async fn send(&self, command: AdvertiserCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("Advertiser is not running"))
    }
}

/// Results of the accept loop and retry timers, tagged with the listener
/// generation they belong to.
enum ListenerEvent {
    Inbound { generation: u64, stream: TcpStream, peer: SocketAddr },
    Failed { generation: u64, error: String },
    Restart { generation: u64 },
}

struct Listener {
    local_addr: SocketAddr,
    advertisement: Advertisement,
    cancel: CancellationToken,
}

enum Step {
    Command(AdvertiserCommand),
    Closed,
    Listener(ListenerEvent),
    Session(SessionEvent),
    Changed(Option<TelemetryValue>),
    Tick,
}

pub struct Advertiser<P: Publisher> {
    identity: Arc<ServiceIdentity>,
    publisher: P,
    settings: AdvertiserSettings,
    board: StatusBoard,

    listener: Option<Listener>,
    generation: u64,
    consecutive_failures: u32,

    /// Accepted sessions still completing their handshake
    pending: HashMap<SessionId, TransportSession>,
    connections: ConnectionSet,

    telemetry: Option<watch::Receiver<TelemetryValue>>,
    value: TelemetryValue,

    commands: mpsc::Receiver<AdvertiserCommand>,
    listener_tx: mpsc::UnboundedSender<ListenerEvent>,
    listener_rx: mpsc::UnboundedReceiver<ListenerEvent>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: CancellationToken,
}

impl<P: Publisher> Advertiser<P> {
    /// Spawn the advertiser task and start advertising immediately.
    pub fn spawn(
        identity: Arc<ServiceIdentity>,
        publisher: P,
        source: &dyn TelemetrySource,
        settings: AdvertiserSettings,
    ) -> AdvertiserHandle {
        let (tx, commands) = mpsc::channel(32);
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let board = StatusBoard::new();
        let value = source.current_value();
        board.set_value(value);
        let status = board.subscribe();

        let advertiser = Self {
            identity,
            publisher,
            settings,
            board,
            listener: None,
            generation: 0,
            consecutive_failures: 0,
            pending: HashMap::new(),
            connections: ConnectionSet::new(),
            telemetry: Some(source.subscribe()),
            value,
            commands,
            listener_tx,
            listener_rx,
            session_tx,
            session_rx,
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(advertiser.run());

        AdvertiserHandle { tx, status }
    }

    async fn run(mut self) {
        tracing::info!("Advertiser starting for {}", self.identity.qualified_type());
        self.start().await;

        let mut ticker = tokio::time::interval(self.settings.broadcast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // consumers get a push when they become ready, so skip the immediate tick
        ticker.tick().await;

        loop {
            let step = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Closed,
                },
                Some(event) = self.listener_rx.recv() => Step::Listener(event),
                Some(event) = self.session_rx.recv() => Step::Session(event),
                changed = next_change(&mut self.telemetry) => Step::Changed(changed),
                _ = ticker.tick() => Step::Tick,
            };

            match step {
                Step::Command(AdvertiserCommand::Stop(reply)) => {
                    self.stop();
                    let _ = reply.send(());
                    break;
                }
                Step::Command(AdvertiserCommand::LocalAddr(reply)) => {
                    let _ = reply.send(self.listener.as_ref().map(|l| l.local_addr));
                }
                Step::Command(AdvertiserCommand::ConnectedPeers(reply)) => {
                    let _ = reply.send(self.connections.peers());
                }
                Step::Closed => {
                    self.stop();
                    break;
                }
                Step::Listener(event) => self.handle_listener_event(event).await,
                Step::Session(event) => self.handle_session_event(event),
                Step::Changed(Some(value)) => {
                    self.value = value;
                    self.board.set_value(value);
                    self.broadcast();
                }
                Step::Changed(None) => {
                    tracing::warn!("Telemetry source went away, serving last value {}%", self.value);
                    self.telemetry = None;
                }
                Step::Tick => self.broadcast(),
            }
        }

        tracing::info!("Advertiser stopped");
    }

    /// Bind, publish and begin accepting. Safe to call again after a
    /// failure: any previous listener is retired first.
    async fn start(&mut self) {
        self.retire_listener();
        self.generation += 1;

        match self.open_listener().await {
            Ok(listener) => {
                tracing::info!(
                    "Listener ready on {} (generation {})",
                    listener.local_addr,
                    self.generation
                );
                self.listener = Some(listener);
                self.consecutive_failures = 0;
                self.board.clear_error();
            }
            Err(e) => self.listener_failed(format!("{:#}", e)),
        }
    }

    async fn open_listener(&self) -> Result<Listener> {
        let bind_addr = SocketAddr::new(self.settings.bind, self.identity.port);
        let tcp = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        let local_addr = tcp
            .local_addr()
            .context("Failed to read listener address")?;

        let advertisement = self
            .publisher
            .publish(&self.identity, local_addr.port())
            .context("Failed to publish service")?;

        let cancel = self.shutdown.child_token();
        tokio::spawn(accept_loop(
            tcp,
            self.generation,
            advertisement.lost(),
            cancel.clone(),
            self.listener_tx.clone(),
        ));

        Ok(Listener { local_addr, advertisement, cancel })
    }

    fn retire_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
            if let Err(e) = self.publisher.withdraw(&listener.advertisement) {
                tracing::warn!("Failed to withdraw advertisement: {:#}", e);
            }
        }
    }

    fn listener_failed(&mut self, error: String) {
        tracing::error!("Listener failed: {}", error);
        self.retire_listener();
        self.drop_sessions();
        self.board.fail(error);

        let delay = self.settings.retry.backoff();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        tracing::info!(
            "Restarting listener in {:?} (attempt {})",
            delay,
            self.consecutive_failures
        );
        self.settings.retry.schedule(
            &self.listener_tx,
            ListenerEvent::Restart { generation: self.generation },
            &self.shutdown,
        );
    }

    async fn handle_listener_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Inbound { generation, stream, peer } => {
                if generation != self.generation || self.listener.is_none() {
                    tracing::debug!("Dropping connection from {} accepted by a retired listener", peer);
                    return;
                }
                let session = TransportSession::accept(stream, peer, self.session_tx.clone());
                tracing::debug!("Inbound session {} from {}", session.id(), peer);
                self.pending.insert(session.id(), session);
            }
            ListenerEvent::Failed { generation, error } => {
                if generation == self.generation && self.listener.is_some() {
                    self.listener_failed(error);
                }
            }
            ListenerEvent::Restart { generation } => {
                if generation == self.generation && self.listener.is_none() {
                    tracing::info!("Retrying listener");
                    self.start().await;
                }
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::State(id, SessionState::Ready) => {
                let Some(session) = self.pending.remove(&id) else {
                    return;
                };
                let peer = session.peer();
                if let Err(e) = session.send(wire::encode(self.value)) {
                    tracing::warn!("Failed to send telemetry: {}", e);
                }
                if self.connections.insert(session) {
                    tracing::info!(
                        "Consumer {} connected ({} total)",
                        peer,
                        self.connections.len()
                    );
                }
                self.board.set_connected(true);
            }
            SessionEvent::State(id, state) if state.is_terminal() => {
                if self.pending.remove(&id).is_some() {
                    tracing::debug!("Discarded session {} before ready: {:?}", id, state);
                } else if let Some(session) = self.connections.remove(id) {
                    tracing::info!(
                        "Consumer {} disconnected: {:?} ({} remaining)",
                        session.peer(),
                        state,
                        self.connections.len()
                    );
                    self.board.set_connected(!self.connections.is_empty());
                }
            }
            SessionEvent::State(id, state) => {
                tracing::debug!("Session {} is {:?}", id, state);
            }
            SessionEvent::Received(id, chunk) => {
                tracing::trace!("Ignoring {} bytes from consumer session {}", chunk.len(), id);
            }
            SessionEvent::SendFailed(id, error) => {
                tracing::warn!("Failed to send telemetry on session {}: {}", id, error);
            }
        }
    }

    fn broadcast(&self) {
        if self.connections.is_empty() {
            return;
        }
        let delivered = self.connections.broadcast(&wire::encode(self.value));
        tracing::debug!("Broadcast {}% to {} consumer(s)", self.value, delivered);
    }

    fn drop_sessions(&mut self) {
        self.pending.clear();
        self.connections.cancel_all();
    }

    fn stop(&mut self) {
        tracing::info!("Advertiser stopping");
        self.telemetry = None;
        self.retire_listener();
        self.drop_sessions();
        self.board.set_connected(false);
        self.shutdown.cancel();
    }
}

/// Wait for the next telemetry change. `None` means the source is gone.
async fn next_change(telemetry: &mut Option<watch::Receiver<TelemetryValue>>) -> Option<TelemetryValue> {
    match telemetry {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn accept_loop(
    listener: TcpListener,
    generation: u64,
    lost: CancellationToken,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<ListenerEvent>,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = lost.cancelled() => {
                let _ = tx.send(ListenerEvent::Failed {
                    generation,
                    error: "service advertisement was lost".to_string(),
                });
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if tx.send(ListenerEvent::Inbound { generation, stream, peer }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ListenerEvent::Failed {
                        generation,
                        error: format!("accept failed: {}", e),
                    });
                    break;
                }
            },
        }
    }

    tracing::debug!("Listener generation {} closed", generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use crate::battery::StaticLevel;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakeState {
        published: usize,
        withdrawn: usize,
        failures_left: usize,
        lost: Vec<CancellationToken>,
    }

    #[derive(Clone, Default)]
    struct FakePublisher {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakePublisher {
        fn failing(times: usize) -> Self {
            let publisher = Self::default();
            publisher.state.lock().unwrap().failures_left = times;
            publisher
        }

        fn published(&self) -> usize {
            self.state.lock().unwrap().published
        }

        fn withdrawn(&self) -> usize {
            self.state.lock().unwrap().withdrawn
        }

        fn lose_latest(&self) {
            let state = self.state.lock().unwrap();
            state.lost.last().expect("nothing published").cancel();
        }
    }

    impl Publisher for FakePublisher {
        fn publish(&self, identity: &ServiceIdentity, port: u16) -> Result<Advertisement> {
            let mut state = self.state.lock().unwrap();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                anyhow::bail!("responder unavailable");
            }
            state.published += 1;
            let advertisement = Advertisement::new(format!("test-{}.{}", port, identity.qualified_type()));
            state.lost.push(advertisement.lost());
            Ok(advertisement)
        }

        fn withdraw(&self, _advertisement: &Advertisement) -> Result<()> {
            self.state.lock().unwrap().withdrawn += 1;
            Ok(())
        }
    }

    fn test_identity() -> Arc<ServiceIdentity> {
        Arc::new(ServiceIdentity {
            port: 0,
            ..ServiceIdentity::default()
        })
    }

    fn test_settings(broadcast_interval: Duration, backoff: Duration) -> AdvertiserSettings {
        AdvertiserSettings {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_interval,
            retry: RetryPolicy::fixed(backoff),
        }
    }

    fn percent(value: u8) -> TelemetryValue {
        TelemetryValue::new(value).unwrap()
    }

    async fn wait_status(handle: &AdvertiserHandle, mut f: impl FnMut(&LinkStatus) -> bool) {
        let mut rx = handle.status();
        tokio::time::timeout(WAIT, rx.wait_for(|s| f(s)))
            .await
            .expect("timed out waiting for status")
            .expect("advertiser dropped its status");
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    async fn connect(handle: &AdvertiserHandle) -> TcpStream {
        let addr = handle.local_addr().await.unwrap().expect("listener not up");
        TcpStream::connect(addr).await.unwrap()
    }

    async fn read_text(stream: &mut TcpStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .expect("timed out reading")
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_pushes_value_when_consumer_ready() {
        let source = StaticLevel::new(percent(42));
        let publisher = FakePublisher::default();
        let handle = Advertiser::spawn(
            test_identity(),
            publisher.clone(),
            &source,
            test_settings(Duration::from_secs(3600), Duration::from_secs(2)),
        );

        let mut client = connect(&handle).await;
        assert_eq!(read_text(&mut client, 2).await, "42");

        wait_status(&handle, |s| s.connected).await;
        assert_eq!(handle.connected_peers().await.unwrap().len(), 1);
        assert_eq!(publisher.published(), 1);
    }

    #[tokio::test]
    async fn test_broadcasts_on_change() {
        let source = StaticLevel::new(percent(42));
        let handle = Advertiser::spawn(
            test_identity(),
            FakePublisher::default(),
            &source,
            test_settings(Duration::from_secs(3600), Duration::from_secs(2)),
        );

        let mut first = connect(&handle).await;
        let mut second = connect(&handle).await;
        assert_eq!(read_text(&mut first, 2).await, "42");
        assert_eq!(read_text(&mut second, 2).await, "42");

        source.set(percent(7));
        assert_eq!(read_text(&mut first, 1).await, "7");
        assert_eq!(read_text(&mut second, 1).await, "7");
        wait_status(&handle, |s| s.value == Some(percent(7))).await;
    }

    #[tokio::test]
    async fn test_broadcasts_periodically() {
        let source = StaticLevel::new(percent(42));
        let handle = Advertiser::spawn(
            test_identity(),
            FakePublisher::default(),
            &source,
            test_settings(Duration::from_millis(50), Duration::from_secs(2)),
        );

        let mut client = connect(&handle).await;
        // initial push followed by at least two ticks
        assert_eq!(read_text(&mut client, 6).await, "424242");
    }

    #[tokio::test]
    async fn test_consumer_disconnect_clears_connected() {
        let source = StaticLevel::new(percent(42));
        let handle = Advertiser::spawn(
            test_identity(),
            FakePublisher::default(),
            &source,
            test_settings(Duration::from_secs(3600), Duration::from_secs(2)),
        );

        let mut client = connect(&handle).await;
        assert_eq!(read_text(&mut client, 2).await, "42");
        wait_status(&handle, |s| s.connected).await;

        drop(client);
        wait_status(&handle, |s| !s.connected).await;
        assert!(handle.connected_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_retried() {
        let source = StaticLevel::new(percent(42));
        let publisher = FakePublisher::failing(1);
        let handle = Advertiser::spawn(
            test_identity(),
            publisher.clone(),
            &source,
            test_settings(Duration::from_secs(3600), Duration::from_millis(300)),
        );

        wait_status(&handle, |s| s.last_error.is_some()).await;
        assert_eq!(handle.local_addr().await.unwrap(), None);

        wait_status(&handle, |s| s.last_error.is_none()).await;
        assert_eq!(publisher.published(), 1);
        assert!(handle.local_addr().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lost_advertisement_drops_consumers_and_recovers() {
        let source = StaticLevel::new(percent(42));
        let publisher = FakePublisher::default();
        let handle = Advertiser::spawn(
            test_identity(),
            publisher.clone(),
            &source,
            test_settings(Duration::from_secs(3600), Duration::from_millis(300)),
        );

        let mut client = connect(&handle).await;
        assert_eq!(read_text(&mut client, 2).await, "42");
        wait_status(&handle, |s| s.connected).await;

        publisher.lose_latest();
        wait_status(&handle, |s| !s.connected && s.last_error.is_some()).await;

        // the old consumer session is closed
        let mut rest = Vec::new();
        let n = tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        wait_until(|| publisher.published() == 2).await;
        wait_status(&handle, |s| s.last_error.is_none()).await;
        assert_eq!(publisher.withdrawn(), 1);
        assert!(handle.connected_peers().await.unwrap().is_empty());

        let mut client = connect(&handle).await;
        assert_eq!(read_text(&mut client, 2).await, "42");
        wait_status(&handle, |s| s.connected).await;
    }

    #[tokio::test]
    async fn test_stop_cancels_everything() {
        let source = StaticLevel::new(percent(42));
        let publisher = FakePublisher::default();
        let handle = Advertiser::spawn(
            test_identity(),
            publisher.clone(),
            &source,
            test_settings(Duration::from_secs(3600), Duration::from_secs(2)),
        );

        let mut client = connect(&handle).await;
        assert_eq!(read_text(&mut client, 2).await, "42");
        wait_status(&handle, |s| s.connected).await;

        handle.stop().await.unwrap();
        assert!(!handle.status().borrow().connected);
        assert_eq!(publisher.withdrawn(), 1);

        let mut rest = Vec::new();
        let n = tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(handle.local_addr().await.is_err());
    }
}
