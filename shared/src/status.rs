use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use crate::types::TelemetryValue;

/// What the presentation layer shows for one side of the link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// Producer: at least one consumer session is ready.
    /// Consumer: the outbound session is ready.
    pub connected: bool,

    /// Latest telemetry value. Kept across disconnects.
    pub value: Option<TelemetryValue>,

    /// Description of the most recent listener/scanner/connection failure
    pub last_error: Option<String>,

    /// When `value` last changed hands
    pub updated_at: Option<DateTime<Utc>>,
}

/// Single-writer cell for a [`LinkStatus`]. The owning component writes,
/// any number of subscribers observe snapshots.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<LinkStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkStatus::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> LinkStatus {
        self.tx.borrow().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.connected != connected;
            status.connected = connected;
            changed
        });
    }

    pub fn set_value(&self, value: TelemetryValue) {
        self.tx.send_modify(|status| {
            status.value = Some(value);
            status.updated_at = Some(Utc::now());
        });
    }

    pub fn clear_error(&self) {
        self.tx.send_if_modified(|status| status.last_error.take().is_some());
    }

    /// Record a failure and drop the connected flag in one notification.
    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_modify(|status| {
            status.connected = false;
            status.last_error = Some(error);
        });
    }
}
