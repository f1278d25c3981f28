use crate::broker::{Broker, EntryStatus};
use crate::listener::TextQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ForwarderSettings {
    pub retry_delay: Duration,
    pub trim_every: u64,
    pub max_stream_length: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub appended: u64,
    /// Payloads abandoned because the broker was unavailable at shutdown
    pub abandoned: u64,
}

/// Append listener output to the broker as `New` entries until the queue
/// completes. Every `trim_every` appends a trim runs in the background.
pub async fn run_forwarder(
    queue: Arc<TextQueue>,
    broker: Arc<dyn Broker>,
    settings: ForwarderSettings,
    cancel: CancellationToken,
) -> ForwarderStats {
    let mut stats = ForwarderStats::default();
    info!("Broker forwarder started");

    while let Some(payload) = queue.pop().await {
        loop {
            match broker.append(&payload, EntryStatus::New, 1, None).await {
                Ok(id) => {
                    stats.appended += 1;
                    debug!(entry = id, "Forwarded payload");
                    break;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        stats.abandoned += 1;
                        break;
                    }
                    warn!(error = %e, delay = ?settings.retry_delay, "Broker append failed, retrying");
                    // Incoming datagrams keep landing in the drop-oldest queue meanwhile
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(settings.retry_delay) => {}
                    }
                }
            }
        }

        if settings.trim_every > 0 && stats.appended > 0 && stats.appended % settings.trim_every == 0 {
            let broker = broker.clone();
            let max_length = settings.max_stream_length;
            tokio::spawn(async move {
                match broker.trim(max_length).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Trimmed broker stream"),
                    Err(e) => warn!(error = %e, "Broker trim failed"),
                }
            });
        }
    }

    info!(appended = stats.appended, abandoned = stats.abandoned, "Broker forwarder stopped");
    stats
}
