//! Telemetry sources feeding the advertiser.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::types::TelemetryValue;

/// Supplies the current battery percentage and notifies on change.
/// Dropping the receiver returned by `subscribe` unsubscribes.
pub trait TelemetrySource: Send + Sync + 'static {
    fn current_value(&self) -> TelemetryValue;

    fn subscribe(&self) -> watch::Receiver<TelemetryValue>;
}

/// A value that only changes when set explicitly. Used on machines without
/// a battery and in tests.
pub struct StaticLevel {
    tx: watch::Sender<TelemetryValue>,
}

impl StaticLevel {
    pub fn new(value: TelemetryValue) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    pub fn set(&self, value: TelemetryValue) {
        self.tx.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }
}

impl TelemetrySource for StaticLevel {
    fn current_value(&self) -> TelemetryValue {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TelemetryValue> {
        self.tx.subscribe()
    }
}

/// Linux power-supply battery, e.g. `/sys/class/power_supply/BAT0/capacity`,
/// sampled on an interval.
pub struct SysfsBattery {
    tx: Arc<watch::Sender<TelemetryValue>>,
}

impl SysfsBattery {
    /// Take a first sample and spawn the polling task. Polling stops when
    /// `cancel` fires.
    pub fn spawn(path: PathBuf, poll_interval: Duration, cancel: CancellationToken) -> Self {
        let initial = sample(&path);
        tracing::info!("Battery at {}: {}%", path.display(), initial);

        let (tx, _) = watch::channel(initial);
        let tx = Arc::new(tx);
        let poll_tx = tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let value = sample(&path);
                        poll_tx.send_if_modified(|current| {
                            if *current == value {
                                return false;
                            }
                            tracing::debug!("Battery changed {}% -> {}%", current, value);
                            *current = value;
                            true
                        });
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        Self { tx }
    }
}

impl TelemetrySource for SysfsBattery {
    fn current_value(&self) -> TelemetryValue {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TelemetryValue> {
        self.tx.subscribe()
    }
}

/// Read the capacity file. An unreadable sensor counts as the unavailable
/// sentinel and is normalized like one.
fn sample(path: &Path) -> TelemetryValue {
    match read_capacity(path) {
        Ok(raw) => TelemetryValue::normalize(raw),
        Err(e) => {
            tracing::debug!("Battery unavailable: {:#}", e);
            TelemetryValue::normalize(-1)
        }
    }
}

fn read_capacity(path: &Path) -> Result<i64> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("Invalid capacity in {}", path.display()))
}
