use crate::record::LogRecord;
use tokio::sync::broadcast;
use tracing::trace;

/// Best-effort push of newly stored records to live viewers.
/// Implementations must not block and never report failure.
pub trait NotificationSink: Send + Sync {
    fn push(&self, record: &LogRecord);
}

/// Fan-out over a broadcast channel. Slow subscribers lag and miss records.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<LogRecord>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn push(&self, record: &LogRecord) {
        // No subscribers is not an error
        if self.sender.send(record.clone()).is_err() {
            trace!(unique_id = %record.unique_id, "No live viewers");
        }
    }
}
