//! One bidirectional TCP stream between producer and consumer.
//!
//! A session runs a single I/O task. Every state transition and every
//! received chunk is reported as a [`SessionEvent`] on the channel handed in
//! by the owning component, so all bookkeeping happens on the owner's loop.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::protocol::MAX_PAYLOAD_LEN;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one underlying connection. Two sessions to the same endpoint
/// still have distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    /// The network path is not usable right now (refused, unreachable).
    Waiting(String),
    Failed(String),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed(_) | SessionState::Cancelled)
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    State(SessionId, SessionState),
    Received(SessionId, Vec<u8>),
    SendFailed(SessionId, String),
}

impl SessionEvent {
    /// The session this event came from
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::State(id, _)
            | SessionEvent::Received(id, _)
            | SessionEvent::SendFailed(id, _) => *id,
        }
    }
}

/// Owner's handle to a running session. Dropping it cancels the session.
#[derive(Debug)]
pub struct TransportSession {
    id: SessionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl PartialEq for TransportSession {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TransportSession {}

impl TransportSession {
    /// Take over a stream accepted by a listener. Reports `Ready` once the
    /// socket is configured, or `Failed` if that handshake does not complete.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (session, outbound_rx) = Self::new(peer);
        let id = session.id;
        let cancel = session.cancel.clone();

        tokio::spawn(async move {
            if let Err(e) = handshake(&stream) {
                tracing::debug!("Inbound session {} from {} failed handshake: {}", id, peer, e);
                let _ = events.send(SessionEvent::State(id, SessionState::Failed(e.to_string())));
                return;
            }
            let _ = events.send(SessionEvent::State(id, SessionState::Ready));
            run_io(id, stream, outbound_rx, cancel, events).await;
        });

        session
    }

    /// Open a connection to `peer`. Reports `Connecting` before dialling,
    /// then `Ready`, `Waiting` for transient network conditions, or `Failed`.
    pub fn connect(peer: SocketAddr, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let (session, outbound_rx) = Self::new(peer);
        let id = session.id;
        let cancel = session.cancel.clone();

        tokio::spawn(async move {
            let _ = events.send(SessionEvent::State(id, SessionState::Connecting));
            let connected = tokio::select! {
                result = TcpStream::connect(peer) => result,
                _ = cancel.cancelled() => {
                    let _ = events.send(SessionEvent::State(id, SessionState::Cancelled));
                    return;
                }
            };

            let stream = match connected.and_then(|stream| handshake(&stream).map(|_| stream)) {
                Ok(stream) => stream,
                Err(e) => {
                    let state = if is_transient(&e) {
                        SessionState::Waiting(e.to_string())
                    } else {
                        SessionState::Failed(e.to_string())
                    };
                    let _ = events.send(SessionEvent::State(id, state));
                    return;
                }
            };

            let _ = events.send(SessionEvent::State(id, SessionState::Ready));
            run_io(id, stream, outbound_rx, cancel, events).await;
        });

        session
    }

    fn new(peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            id: SessionId::next(),
            peer,
            outbound,
            cancel: CancellationToken::new(),
        };
        (session, outbound_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a payload for writing. Fails only if the session's I/O task has
    /// already finished; write errors arrive later as `SendFailed`.
    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.outbound
            .send(payload)
            .map_err(|_| anyhow!("session {} to {} is closed", self.id, self.peer))
    }

    /// Fire-and-forget cancel. The I/O task reports `Cancelled` and closes
    /// the socket.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn handshake(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.peer_addr()?;
    Ok(())
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

async fn run_io(
    id: SessionId,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SessionState::Cancelled,

            Some(payload) = outbound.recv() => {
                if let Err(e) = writer.write_all(&payload).await {
                    tracing::debug!("Session {} write failed: {}", id, e);
                    let _ = events.send(SessionEvent::SendFailed(id, e.to_string()));
                }
            }

            read = reader.read(&mut buf) => match read {
                Ok(0) => break SessionState::Failed("connection closed by peer".to_string()),
                Ok(n) => {
                    if events.send(SessionEvent::Received(id, buf[..n].to_vec())).is_err() {
                        break SessionState::Cancelled;
                    }
                }
                Err(e) => break SessionState::Failed(e.to_string()),
            },
        }
    };

    tracing::debug!("Session {} ended: {:?}", id, end);
    let _ = events.send(SessionEvent::State(id, end));
}
