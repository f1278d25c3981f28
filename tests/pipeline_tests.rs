/// End-to-end tests for both ingest paths
///
/// - UDP -> listener -> forwarder -> broker -> raw consumer -> storage
/// - UDP -> listener -> flush engine -> storage
/// - Direct mode with storage down ends in a dead-letter file
/// - Parse failures travel to the failed group and land in dead-letter
use async_trait::async_trait;
use loqi::broker::{Broker, DuckDbBroker, EntryStatus};
use loqi::config::types::{ConsumerGroupConfig, ListenerConfig, PipelineConfig, PipelineMode};
use loqi::listener::UdpListener;
use loqi::normalize::Normalizer;
use loqi::pipeline::{
    run_forwarder, BatchConsumer, DeadLetterWriter, FailedEntryHandler, FlushEngine, ForwarderSettings, GroupRunner,
};
use loqi::record::LogRecord;
use loqi::storage::{DuckDbStorage, RecordSink, SearchQuery, Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_config() -> ListenerConfig {
        ListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            queue_capacity: 1000,
            retry_delay: Duration::from_millis(10),
        }
    }

    async fn send_all(listener: &UdpListener, payloads: &[&str]) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for payload in payloads {
            socket.send_to(payload.as_bytes(), listener.local_addr()).await.unwrap();
        }
    }

    /// Poll `check` every 20ms until it holds or five seconds pass.
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn stored_count(storage: &DuckDbStorage) -> u64 {
        storage
            .search(&SearchQuery::default())
            .await
            .map(|r| r.pagination.total_count)
            .unwrap_or(0)
    }

    struct DownSink;

    #[async_trait]
    impl RecordSink for DownSink {
        async fn write_batch(&self, _records: &[LogRecord]) -> Result<(), StorageError> {
            Err(StorageError::Database("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_brokered_udp_to_storage() {
        let cancel = CancellationToken::new();
        let listener = UdpListener::start(&listener_config(), cancel.child_token()).await.unwrap();

        let broker = Arc::new(DuckDbBroker::in_memory().unwrap());
        broker.init_schema().await.unwrap();
        let storage = Arc::new(DuckDbStorage::in_memory().unwrap());
        storage.init_schema().await.unwrap();

        let forwarder = tokio::spawn(run_forwarder(
            listener.receiver(),
            broker.clone(),
            ForwarderSettings {
                retry_delay: Duration::from_millis(10),
                trim_every: 1000,
                max_stream_length: 10_000,
            },
            cancel.child_token(),
        ));

        let pipeline = PipelineConfig {
            mode: PipelineMode::Brokered,
            max_batch_size: 2,
            flush_interval: Duration::from_millis(100),
            ..PipelineConfig::default()
        };
        let consumer = Arc::new(BatchConsumer::new(
            broker.clone(),
            storage.clone(),
            Arc::new(Normalizer::default()),
            ConsumerGroupConfig::named("raw-logs", 100, Duration::from_millis(20)),
            &pipeline,
        ));
        let consumer_task = tokio::spawn(consumer.clone().run(cancel.child_token()));

        send_all(
            &listener,
            &[
                r#"{"level":"error","message":"payment declined","source":"billing"}"#,
                "WARN cache miss ratio high",
            ],
        )
        .await;

        let storage_ref = storage.clone();
        assert!(eventually(|| { let s = storage_ref.clone(); async move { stored_count(&s).await == 2 } }).await);

        let results = storage
            .search(&SearchQuery {
                search_text: Some("payment".to_string()),
                ..SearchQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(results.records.len(), 1);
        assert_eq!(results.records[0].source, "billing");
        assert_eq!(results.records[0].level.id(), 4);

        cancel.cancel();
        listener.stop().await;
        let stats = forwarder.await.unwrap();
        assert_eq!(stats.appended, 2);
        consumer_task.await.unwrap();

        // Everything stored was acknowledged
        assert!(eventually(|| {
            let b = broker.clone();
            async move { b.pending("raw-logs").await.unwrap_or(1) == 0 }
        })
        .await);
        assert_eq!(consumer.stats().stored, 2);
    }

    #[tokio::test]
    async fn test_direct_udp_to_storage() {
        let cancel = CancellationToken::new();
        let listener = UdpListener::start(&listener_config(), cancel.child_token()).await.unwrap();
        let storage = Arc::new(DuckDbStorage::in_memory().unwrap());
        storage.init_schema().await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mut pipeline = PipelineConfig {
            mode: PipelineMode::Direct,
            ..PipelineConfig::default()
        };
        pipeline.buffer.batch_size = 3;
        pipeline.buffer.flush_interval = Duration::from_millis(50);

        let engine = Arc::new(FlushEngine::new(storage.clone(), DeadLetterWriter::new(dir.path()), &pipeline));
        let task = tokio::spawn(engine.clone().run(
            listener.receiver(),
            Arc::new(Normalizer::default()),
            cancel.child_token(),
        ));

        send_all(&listener, &["first line", "second line", "ERROR third line", "fourth line"]).await;

        let storage_ref = storage.clone();
        assert!(eventually(|| { let s = storage_ref.clone(); async move { stored_count(&s).await == 4 } }).await);

        cancel.cancel();
        listener.stop().await;
        task.await.unwrap();

        assert_eq!(engine.stats().written, 4);
        assert_eq!(engine.buffered(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_direct_mode_storage_down_dead_letters_on_shutdown() {
        let cancel = CancellationToken::new();
        let listener = UdpListener::start(&listener_config(), cancel.child_token()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mut pipeline = PipelineConfig {
            mode: PipelineMode::Direct,
            ..PipelineConfig::default()
        };
        pipeline.buffer.batch_size = 1000;
        pipeline.buffer.flush_interval = Duration::from_secs(3600);
        pipeline.health_check_interval = Duration::from_secs(3600);

        let engine = Arc::new(FlushEngine::new(Arc::new(DownSink), DeadLetterWriter::new(dir.path()), &pipeline));
        let task = tokio::spawn(engine.clone().run(
            listener.receiver(),
            Arc::new(Normalizer::default()),
            cancel.child_token(),
        ));

        send_all(&listener, &["one", "two", "three"]).await;
        let engine_ref = engine.clone();
        assert!(eventually(|| { let e = engine_ref.clone(); async move { e.buffered() == 3 } }).await);

        cancel.cancel();
        listener.stop().await;
        task.await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("failed-batch-"));

        let records: Vec<LogRecord> = serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
        let mut messages: Vec<_> = records.iter().map(|r| r.message.as_str()).collect();
        messages.sort();
        assert_eq!(messages, vec!["one", "three", "two"]);
        assert_eq!(engine.stats().dead_lettered, 3);
    }

    #[tokio::test]
    async fn test_failed_entries_reach_dead_letter() {
        let broker = Arc::new(DuckDbBroker::in_memory().unwrap());
        broker.init_schema().await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        broker
            .append("   ", EntryStatus::Failed, 1, Some("parse failure: payload is empty"))
            .await
            .unwrap();
        // Not for the failed group
        broker.append("ok", EntryStatus::New, 1, None).await.unwrap();

        let runner = GroupRunner::new(
            broker.clone(),
            ConsumerGroupConfig::named("failed-logs", 50, Duration::from_millis(10)),
            Arc::new(FailedEntryHandler::new(DeadLetterWriter::new(dir.path()))),
            Duration::from_millis(10),
        );
        assert!(runner.init(&[EntryStatus::Failed]).await.unwrap());
        let cancel = CancellationToken::new();
        assert_eq!(runner.poll_once(&cancel).await.unwrap(), 1);
        assert_eq!(broker.pending("failed-logs").await.unwrap(), 0);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        assert!(content.contains("parse failure"));
    }
}
