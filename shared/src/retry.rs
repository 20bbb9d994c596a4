use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::protocol::RETRY_BACKOFF;

/// Fixed-backoff retry: the same delay before every attempt, unbounded
/// attempts, no growth and no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(RETRY_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn fixed(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Delay before every retry
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Deliver `event` on `tx` once the backoff elapses, unless `cancel`
    /// fires first. The receiver is expected to be a component's serialized
    /// event loop.
    pub fn schedule<T: Send + 'static>(
        &self,
        tx: &mpsc::UnboundedSender<T>,
        event: T,
        cancel: &CancellationToken,
    ) {
        let delay = self.backoff;
        let tx = tx.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(event);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}
