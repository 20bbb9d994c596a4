use std::net::SocketAddr;
use shared::session::{SessionId, TransportSession};

/// Live consumer sessions on the producer, in acceptance order.
/// A session appears at most once; the set is non-empty exactly when some
/// consumer is connected.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    sessions: Vec<TransportSession>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session that reached ready. Returns false if a session with
    /// the same identity is already present.
    pub fn insert(&mut self, session: TransportSession) -> bool {
        if self.contains(session.id()) {
            tracing::warn!("Session {} is already connected", session.id());
            return false;
        }
        self.sessions.push(session);
        true
    }

    pub fn remove(&mut self, id: SessionId) -> Option<TransportSession> {
        let idx = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.remove(idx))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|s| s.peer()).collect()
    }

    /// Send `payload` to every session independently. A session whose send
    /// fails stays in the set until its own failure transition arrives.
    /// Returns how many sessions accepted the payload.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in &self.sessions {
            match session.send(payload.to_vec()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Failed to send telemetry: {}", e),
            }
        }
        delivered
    }

    /// Cancel and forget every session.
    pub fn cancel_all(&mut self) {
        for session in self.sessions.drain(..) {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use shared::session::{SessionEvent, SessionState};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Accept one loopback connection and wait for the session to be ready.
    async fn loopback_session(
        listener: &TcpListener,
        events: &mpsc::UnboundedSender<SessionEvent>,
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (TransportSession, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let session = TransportSession::accept(stream, peer, events.clone());

        match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            SessionEvent::State(id, SessionState::Ready) => assert_eq!(id, session.id()),
            other => panic!("unexpected event {:?}", other),
        }
        (session, client)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = ConnectionSet::new();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (session, client) = loopback_session(&listener, &tx, &mut rx).await;
            assert!(set.insert(session));
            clients.push(client);
        }

        assert_eq!(set.broadcast(b"87"), 3);

        for client in &mut clients {
            let mut buf = [0u8; 2];
            timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf, b"87");
        }
    }

    #[tokio::test]
    async fn test_acceptance_order_and_removal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = ConnectionSet::new();

        let (first, _c1) = loopback_session(&listener, &tx, &mut rx).await;
        let (second, _c2) = loopback_session(&listener, &tx, &mut rx).await;
        let first_id = first.id();
        let expected = vec![first.peer(), second.peer()];

        set.insert(first);
        set.insert(second);
        assert_eq!(set.peers(), expected);

        assert!(set.remove(first_id).is_some());
        assert!(set.remove(first_id).is_none(), "Removal happens exactly once");
        assert_eq!(set.len(), 1);
        assert!(!set.contains(first_id));
    }

    #[tokio::test]
    async fn test_send_failure_does_not_block_others() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = ConnectionSet::new();

        let (dead, _c1) = loopback_session(&listener, &tx, &mut rx).await;
        let (live, mut live_client) = loopback_session(&listener, &tx, &mut rx).await;
        let dead_id = dead.id();

        dead.cancel();
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                SessionEvent::State(id, SessionState::Cancelled) if id == dead_id => break,
                _ => continue,
            }
        }
        // the I/O task drops its queue right after reporting
        timeout(WAIT, async {
            while dead.send(Vec::new()).is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        set.insert(dead);
        set.insert(live);

        assert_eq!(set.broadcast(b"5"), 1);
        assert_eq!(set.len(), 2, "Send failure alone does not remove a session");

        let mut buf = [0u8; 1];
        timeout(WAIT, live_client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"5");
    }

    #[tokio::test]
    async fn test_cancel_all_empties_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = ConnectionSet::new();

        let (session, mut client) = loopback_session(&listener, &tx, &mut rx).await;
        set.insert(session);
        set.cancel_all();
        assert!(set.is_empty());

        let mut rest = Vec::new();
        let n = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }
}
