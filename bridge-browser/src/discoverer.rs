//! Consumer side of the link.
//!
//! One task owns the scan, the single outbound session slot and the status
//! board. Scan events, session events and retry timers are all delivered to
//! that task, so there is never more than one live connection attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use shared::retry::RetryPolicy;
use shared::session::{SessionEvent, SessionState, TransportSession};
use shared::status::{LinkStatus, StatusBoard};
use shared::types::{select_endpoint, DiscoveryResult, ServiceIdentity};
use shared::wire;
use crate::mdns::browser::{ScanEvent, ScanHandle, Scanner};

#[derive(Debug, Clone, Default)]
pub struct DiscovererSettings {
    /// Backoff before restarting a failed scan
    pub rescan: RetryPolicy,
    /// Backoff before reconnecting to an endpoint that reported waiting
    pub reconnect: RetryPolicy,
}

/// Commands sent to the discoverer task
pub enum DiscovererCommand {
    ActiveEndpoint(oneshot::Sender<Option<SocketAddr>>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running discoverer
#[derive(Clone)]
pub struct DiscovererHandle {
    tx: mpsc::Sender<DiscovererCommand>,
    status: watch::Receiver<LinkStatus>,
}

impl DiscovererHandle {
    /// Connection state, latest telemetry value and last error
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Endpoint of the session currently occupying the connection slot
    pub async fn active_endpoint(&self) -> Result<Option<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        self.send(DiscovererCommand::ActiveEndpoint(reply)).await?;
        Ok(rx.await?)
    }

    /// Stop scanning and close the connection
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(DiscovererCommand::Stop(reply)).await?;
        Ok(rx.await?)
    }

    async fn send(&self, command: DiscovererCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("Discoverer is not running"))
    }
}

/// Retry timers. Each carries the counter value it was scheduled under and
/// is discarded if a newer scan or connection attempt has started since.
enum Timer {
    Rescan { scan: u64 },
    Reconnect { attempt: u64, target: DiscoveryResult },
}

struct Link {
    session: TransportSession,
    target: DiscoveryResult,
}

enum Step {
    Command(DiscovererCommand),
    Closed,
    Scan(Option<ScanEvent>),
    Session(SessionEvent),
    Timer(Timer),
}

pub struct Discoverer<S: Scanner> {
    identity: Arc<ServiceIdentity>,
    scanner: S,
    settings: DiscovererSettings,
    board: StatusBoard,

    scan: Option<ScanHandle>,
    scans: u64,
    link: Option<Link>,
    attempts: u64,

    commands: mpsc::Receiver<DiscovererCommand>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    shutdown: CancellationToken,
}

impl<S: Scanner> Discoverer<S> {
    /// Spawn the discoverer task and start scanning immediately.
    pub fn spawn(
        identity: Arc<ServiceIdentity>,
        scanner: S,
        settings: DiscovererSettings,
    ) -> DiscovererHandle {
        let (tx, commands) = mpsc::channel(32);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let board = StatusBoard::new();
        let status = board.subscribe();

        let discoverer = Self {
            identity,
            scanner,
            settings,
            board,
            scan: None,
            scans: 0,
            link: None,
            attempts: 0,
            commands,
            session_tx,
            session_rx,
            timer_tx,
            timer_rx,
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(discoverer.run());

        DiscovererHandle { tx, status }
    }

    async fn run(mut self) {
        tracing::info!("Discoverer looking for {}", self.identity.qualified_type());
        self.start();

        loop {
            let step = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Closed,
                },
                event = next_scan_event(&mut self.scan) => Step::Scan(event),
                Some(event) = self.session_rx.recv() => Step::Session(event),
                Some(timer) = self.timer_rx.recv() => Step::Timer(timer),
            };

            match step {
                Step::Command(DiscovererCommand::Stop(reply)) => {
                    self.stop();
                    let _ = reply.send(());
                    break;
                }
                Step::Command(DiscovererCommand::ActiveEndpoint(reply)) => {
                    let _ = reply.send(self.link.as_ref().map(|l| l.session.peer()));
                }
                Step::Closed => {
                    self.stop();
                    break;
                }
                Step::Scan(Some(event)) => self.handle_scan_event(event),
                Step::Scan(None) => self.scan_failed("scanner stopped unexpectedly".to_string()),
                Step::Session(event) => self.handle_session_event(event),
                Step::Timer(Timer::Rescan { scan }) => {
                    if scan == self.scans && self.scan.is_none() {
                        tracing::info!("Retrying scan");
                        self.start();
                    }
                }
                Step::Timer(Timer::Reconnect { attempt, target }) => {
                    if attempt == self.attempts && self.link.is_none() {
                        tracing::info!("Retrying connection to {}", target.endpoint);
                        self.connect(target);
                    }
                }
            }
        }

        tracing::info!("Discoverer stopped");
    }

    /// Begin a fresh scan, replacing any running one.
    fn start(&mut self) {
        if let Some(old) = self.scan.take() {
            old.cancel();
        }
        self.scans += 1;

        match self.scanner.scan(&self.identity) {
            Ok(handle) => self.scan = Some(handle),
            Err(e) => self.scan_failed(format!("{:#}", e)),
        }
    }

    /// Scan failure takes the connection down with it. The next scan result
    /// dials again, and any pending reconnect becomes stale.
    fn scan_failed(&mut self, error: String) {
        tracing::error!("Scan failed: {}", error);
        self.board.fail(error);
        if let Some(scan) = self.scan.take() {
            scan.cancel();
        }
        self.attempts += 1;
        if let Some(link) = self.link.take() {
            tracing::debug!("Closing session {} to {}", link.session.id(), link.target.endpoint);
            link.session.cancel();
        }

        tracing::info!("Restarting scan in {:?}", self.settings.rescan.backoff());
        self.settings.rescan.schedule(
            &self.timer_tx,
            Timer::Rescan { scan: self.scans },
            &self.shutdown,
        );
    }

    fn handle_scan_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Ready => {
                tracing::info!("Scan ready");
                self.board.clear_error();
            }
            ScanEvent::Waiting(reason) => {
                tracing::warn!("Scan waiting: {}", reason);
            }
            ScanEvent::Failed(error) => self.scan_failed(error),
            ScanEvent::Results(results) => {
                tracing::debug!("Scan found {} producer(s)", results.len());
                let Some(target) = select_endpoint(&results) else {
                    return;
                };
                if self.link.as_ref().is_some_and(|l| l.target == *target) {
                    return;
                }
                self.connect(target.clone());
            }
        }
    }

    /// Open a session to `target`, superseding whatever occupies the slot.
    fn connect(&mut self, target: DiscoveryResult) {
        self.attempts += 1;
        if let Some(old) = self.link.take() {
            tracing::debug!(
                "Replacing session {} to {}",
                old.session.id(),
                old.target.endpoint
            );
            old.session.cancel();
            self.board.set_connected(false);
        }

        tracing::info!("Connecting to {} at {}", target.instance_name, target.endpoint);
        let session = TransportSession::connect(target.endpoint, self.session_tx.clone());
        self.link = Some(Link { session, target });
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        let id = event.session();
        if self.link.as_ref().map(|l| l.session.id()) != Some(id) {
            tracing::trace!("Ignoring event from superseded session {}", id);
            return;
        }

        match event {
            SessionEvent::State(_, SessionState::Ready) => {
                tracing::info!("Connected to producer");
                self.board.clear_error();
                self.board.set_connected(true);
            }
            SessionEvent::State(_, SessionState::Waiting(reason)) => {
                tracing::warn!("Connection waiting: {}", reason);
                self.board.fail(reason);
                let Some(link) = self.link.take() else {
                    return;
                };
                link.session.cancel();
                self.settings.reconnect.schedule(
                    &self.timer_tx,
                    Timer::Reconnect { attempt: self.attempts, target: link.target },
                    &self.shutdown,
                );
            }
            SessionEvent::State(_, SessionState::Failed(error)) => {
                tracing::warn!("Connection failed: {}", error);
                self.board.fail(error);
                self.link = None;
            }
            SessionEvent::State(_, SessionState::Cancelled) => {
                self.board.set_connected(false);
                self.link = None;
            }
            SessionEvent::State(id, SessionState::Connecting) => {
                tracing::trace!("Session {} dialling", id);
            }
            SessionEvent::Received(_, chunk) => match wire::decode(&chunk) {
                Ok(value) => {
                    tracing::debug!("Received {}%", value);
                    self.board.set_value(value);
                }
                Err(e) => tracing::debug!("Dropping payload: {:#}", e),
            },
            SessionEvent::SendFailed(_, error) => {
                tracing::debug!("Unexpected send failure: {}", error);
            }
        }
    }

    fn stop(&mut self) {
        tracing::info!("Discoverer stopping");
        if let Some(scan) = self.scan.take() {
            scan.cancel();
        }
        if let Some(link) = self.link.take() {
            link.session.cancel();
        }
        self.board.set_connected(false);
        self.shutdown.cancel();
    }
}

async fn next_scan_event(scan: &mut Option<ScanHandle>) -> Option<ScanEvent> {
    match scan {
        Some(handle) => handle.next().await,
        None => std::future::pending().await,
    }
}
