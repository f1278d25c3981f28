use super::{consumer_name, PipelineError};
use crate::broker::{Broker, EntryId, EntryStatus, RawMessage, StartPosition};
use crate::config::types::ConsumerGroupConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-group processing for groups that handle each read batch in one pass.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Process a batch and return the ids that are safe to acknowledge.
    /// Ids left out stay pending and are redelivered through claim.
    async fn handle(&self, entries: Vec<RawMessage>, cancel: &CancellationToken) -> Vec<EntryId>;
}

/// Append a copy of `entry` with a new status. Returns false if the append failed.
pub(crate) async fn reappend(
    broker: &dyn Broker,
    entry: &RawMessage,
    status: EntryStatus,
    attempts: u32,
    error_info: &str,
) -> bool {
    match broker.append(&entry.payload, status, attempts, Some(error_info)).await {
        Ok(_) => true,
        Err(e) => {
            warn!(entry = entry.id, status = %status, error = %e, "Failed to re-append entry");
            false
        }
    }
}

/// Read loop for one consumer group driving an [`EntryHandler`].
pub struct GroupRunner {
    broker: Arc<dyn Broker>,
    group: ConsumerGroupConfig,
    consumer: String,
    handler: Arc<dyn EntryHandler>,
    read_error_delay: Duration,
}

impl GroupRunner {
    pub fn new(
        broker: Arc<dyn Broker>,
        group: ConsumerGroupConfig,
        handler: Arc<dyn EntryHandler>,
        read_error_delay: Duration,
    ) -> Self {
        let consumer = consumer_name(&group.name);
        Self {
            broker,
            group,
            consumer,
            handler,
            read_error_delay,
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer = name.into();
        self
    }

    pub async fn init(&self, statuses: &[EntryStatus]) -> Result<bool, PipelineError> {
        let created = self
            .broker
            .ensure_group(&self.group.name, StartPosition::Beginning, statuses)
            .await?;
        if created {
            info!(group = %self.group.name, "Created consumer group");
        }
        Ok(created)
    }

    /// Hand entries to the handler and acknowledge what it returns.
    pub async fn process(&self, entries: Vec<RawMessage>, cancel: &CancellationToken) -> Result<u64, PipelineError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let ids = self.handler.handle(entries, cancel).await;
        if ids.is_empty() {
            return Ok(0);
        }
        let acked = self.broker.ack(&self.group.name, &ids).await?;
        debug!(group = %self.group.name, acked, "Acknowledged entries");
        Ok(acked)
    }

    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<u64, PipelineError> {
        let entries = self
            .broker
            .read(&self.group.name, &self.consumer, self.group.batch_size, self.group.block_time)
            .await?;
        self.process(entries, cancel).await
    }

    /// Process this consumer's own pending entries, then entries idle past the
    /// ack timeout.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<u64, PipelineError> {
        let own = self.broker.pending_for(&self.group.name, &self.consumer).await?;
        let mut acked = self.process(own, cancel).await?;

        let claimed = self
            .broker
            .claim(&self.group.name, &self.consumer, self.group.ack_timeout)
            .await?;
        acked += self.process(claimed, cancel).await?;
        Ok(acked)
    }

    pub async fn run(self, statuses: Vec<EntryStatus>, cancel: CancellationToken) {
        while let Err(e) = self.init(&statuses).await {
            warn!(group = %self.group.name, error = %e, "Failed to create consumer group, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.read_error_delay) => {}
            }
        }

        info!(group = %self.group.name, consumer = %self.consumer, "Group consumer started");

        let mut last_recovery: Option<Instant> = None;
        while !cancel.is_cancelled() {
            let due = last_recovery.map_or(true, |at| at.elapsed() >= self.group.ack_timeout);
            let result = if due {
                last_recovery = Some(Instant::now());
                self.recover(&cancel).await
            } else {
                self.poll_once(&cancel).await
            };

            if let Err(e) = result {
                warn!(group = %self.group.name, error = %e, "Group read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.read_error_delay) => {}
                }
            }
        }

        info!(group = %self.group.name, "Group consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DuckDbBroker;
    use std::sync::Mutex;

    /// Acknowledges every entry whose payload is not "keep".
    #[derive(Default)]
    struct Selective {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EntryHandler for Selective {
        async fn handle(&self, entries: Vec<RawMessage>, _cancel: &CancellationToken) -> Vec<EntryId> {
            let mut ids = Vec::new();
            for entry in entries {
                self.seen.lock().unwrap().push(entry.payload.clone());
                if entry.payload != "keep" {
                    ids.push(entry.id);
                }
            }
            ids
        }
    }

    fn group() -> ConsumerGroupConfig {
        ConsumerGroupConfig {
            name: "retry-logs".to_string(),
            batch_size: 10,
            block_time: Duration::from_millis(10),
            max_retries: 3,
            ack_timeout: Duration::from_secs(30),
        }
    }

    async fn setup() -> (Arc<DuckDbBroker>, Arc<Selective>, GroupRunner) {
        let broker = Arc::new(DuckDbBroker::in_memory().unwrap());
        broker.init_schema().await.unwrap();
        let handler = Arc::new(Selective::default());
        let runner = GroupRunner::new(broker.clone(), group(), handler.clone(), Duration::from_millis(10))
            .with_consumer_name("retry-test");
        runner.init(&[EntryStatus::Retry]).await.unwrap();
        (broker, handler, runner)
    }

    #[tokio::test]
    async fn test_only_returned_ids_are_acked() {
        let (broker, handler, runner) = setup().await;
        for payload in ["done", "keep", "done too"] {
            broker.append(payload, EntryStatus::Retry, 2, None).await.unwrap();
        }
        broker.append("not mine", EntryStatus::New, 1, None).await.unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(runner.poll_once(&cancel).await.unwrap(), 2);
        assert_eq!(broker.pending("retry-logs").await.unwrap(), 1);
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_recover_replays_own_pending() {
        let (broker, handler, runner) = setup().await;
        broker.append("keep", EntryStatus::Retry, 2, None).await.unwrap();

        let cancel = CancellationToken::new();
        runner.poll_once(&cancel).await.unwrap();
        assert_eq!(runner.recover(&cancel).await.unwrap(), 0);
        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["keep", "keep"]);
    }

    #[tokio::test]
    async fn test_init_reports_existing_group() {
        let (_broker, _handler, runner) = setup().await;
        assert!(!runner.init(&[EntryStatus::Retry]).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (broker, handler, runner) = setup().await;
        broker.append("once", EntryStatus::Retry, 2, None).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.run(vec![EntryStatus::Retry], cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["once"]);
        assert_eq!(broker.pending("retry-logs").await.unwrap(), 0);
    }
}
