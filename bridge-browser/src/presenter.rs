//! Terminal rendering of the consumer's link status.

use chrono::Local;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::status::LinkStatus;

/// One-line summary of `status`.
pub fn render(status: &LinkStatus) -> String {
    let mut line = match (status.connected, status.value) {
        (true, Some(value)) => format!("Connected: {}%", value),
        (true, None) => "Connected: waiting for first reading".to_string(),
        (false, Some(value)) => format!("Searching for producer... (last seen {}%)", value),
        (false, None) => "Searching for producer...".to_string(),
    };

    if let Some(at) = status.updated_at {
        line.push_str(&format!(" [updated {}]", at.with_timezone(&Local).format("%H:%M:%S")));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(" - {}", error));
    }

    line
}

/// Print every distinct rendering of the status until `cancel` fires or the
/// discoverer goes away.
pub async fn run(mut status: watch::Receiver<LinkStatus>, cancel: CancellationToken) {
    let mut shown = String::new();
    loop {
        let line = render(&status.borrow_and_update());
        if line != shown {
            tracing::info!("{}", line);
            shown = line;
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
