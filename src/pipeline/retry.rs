use super::group::{reappend, EntryHandler};
use super::normalize_entry;
use crate::broker::{Broker, EntryId, EntryStatus, RawMessage};
use crate::normalize::Normalizer;
use crate::record::LogRecord;
use crate::storage::RecordSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `base * 2^(attempts-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

/// Handles the retry group: waits out the backoff for the batch, then
/// normalizes and writes it again. Entries that keep failing move on to the
/// failed group once they reach `max_retries` attempts.
pub struct RetryHandler {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn RecordSink>,
    normalizer: Arc<Normalizer>,
    max_retries: u32,
    backoff: Duration,
    backoff_max: Duration,
}

impl RetryHandler {
    pub fn new(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn RecordSink>,
        normalizer: Arc<Normalizer>,
        max_retries: u32,
        backoff: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            broker,
            sink,
            normalizer,
            max_retries,
            backoff,
            backoff_max,
        }
    }

    async fn send_on(&self, entry: &RawMessage, error: &str) -> bool {
        if entry.attempts < self.max_retries {
            reappend(self.broker.as_ref(), entry, EntryStatus::Retry, entry.attempts + 1, error).await
        } else {
            let info = format!("max retries ({}) exceeded", self.max_retries);
            warn!(entry = entry.id, attempts = entry.attempts, last_error = error, "Giving up on entry");
            reappend(self.broker.as_ref(), entry, EntryStatus::Failed, entry.attempts, &info).await
        }
    }
}

#[async_trait]
impl EntryHandler for RetryHandler {
    async fn handle(&self, entries: Vec<RawMessage>, cancel: &CancellationToken) -> Vec<EntryId> {
        let delay = entries
            .iter()
            .map(|entry| backoff_delay(self.backoff, self.backoff_max, entry.attempts))
            .max()
            .unwrap_or(Duration::ZERO);
        if !delay.is_zero() {
            debug!(count = entries.len(), delay = ?delay, "Backing off before retry");
            tokio::select! {
                // Left pending; picked up again on restart
                _ = cancel.cancelled() => return Vec::new(),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut ack = Vec::new();
        let mut records: Vec<LogRecord> = Vec::new();
        let mut parsed: Vec<RawMessage> = Vec::new();

        for entry in entries {
            match normalize_entry(&self.normalizer, &entry) {
                Ok(record) => {
                    records.push(record);
                    parsed.push(entry);
                }
                Err(failure) => {
                    let info = format!("parse failure: {}", failure);
                    if reappend(self.broker.as_ref(), &entry, EntryStatus::Failed, entry.attempts, &info).await {
                        ack.push(entry.id);
                    }
                }
            }
        }

        if records.is_empty() {
            return ack;
        }

        match self.sink.write_batch(&records).await {
            Ok(()) => {
                info!(count = records.len(), "Stored retried entries");
                ack.extend(parsed.iter().map(|entry| entry.id));
            }
            Err(e) => {
                warn!(count = records.len(), error = %e, "Retry write failed");
                let error = e.to_string();
                for entry in &parsed {
                    if self.send_on(entry, &error).await {
                        ack.push(entry.id);
                    }
                }
            }
        }
        ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DuckDbBroker, StartPosition};
    use crate::storage::StorageError;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        failing: AtomicBool,
        records: Mutex<Vec<LogRecord>>,
    }

    #[async_trait]
    impl RecordSink for TestSink {
        async fn write_batch(&self, records: &[LogRecord]) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Database("locked".to_string()));
            }
            self.records.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
    }

    fn entry(id: EntryId, payload: &str, attempts: u32) -> RawMessage {
        RawMessage {
            id,
            payload: payload.to_string(),
            status: EntryStatus::Retry,
            attempts,
            error_info: None,
            appended_at: Utc::now(),
        }
    }

    async fn setup(failing: bool) -> (Arc<DuckDbBroker>, Arc<TestSink>, RetryHandler) {
        let broker = Arc::new(DuckDbBroker::in_memory().unwrap());
        broker.init_schema().await.unwrap();
        broker.ensure_group("all", StartPosition::Beginning, &[]).await.unwrap();
        let sink = Arc::new(TestSink::default());
        sink.failing.store(failing, Ordering::SeqCst);
        let handler = RetryHandler::new(
            broker.clone(),
            sink.clone(),
            Arc::new(Normalizer::default()),
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        (broker, sink, handler)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, max, 7), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 200), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_successful_retry_acks_all() {
        let (_broker, sink, handler) = setup(false).await;
        let ids = handler
            .handle(vec![entry(1, "a", 2), entry(2, "b", 3)], &CancellationToken::new())
            .await;
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(sink.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_retry_increments_attempts_then_gives_up() {
        let (broker, _sink, handler) = setup(true).await;
        let ids = handler
            .handle(vec![entry(1, "again", 2), entry(2, "last", 3)], &CancellationToken::new())
            .await;
        assert_eq!(ids, vec![1, 2]);

        let appended = broker.read("all", "c", 10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].status, EntryStatus::Retry);
        assert_eq!(appended[0].attempts, 3);
        assert_eq!(appended[1].status, EntryStatus::Failed);
        assert_eq!(appended[1].error_info.as_deref(), Some("max retries (3) exceeded"));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_acks_nothing() {
        let (_broker, sink, mut handler) = setup(false).await;
        handler.backoff = Duration::from_secs(30);
        handler.backoff_max = Duration::from_secs(30);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ids = handler.handle(vec![entry(1, "x", 2)], &cancel).await;
        assert!(ids.is_empty());
        assert!(sink.records.lock().unwrap().is_empty());
    }
}
