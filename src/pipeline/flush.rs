use super::circuit::{CircuitBreaker, CircuitState};
use super::dead_letter::DeadLetterWriter;
use super::ticker;
use crate::config::types::PipelineConfig;
use crate::listener::TextQueue;
use crate::normalize::Normalizer;
use crate::record::LogRecord;
use crate::storage::RecordSink;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CRITICAL_OCCUPANCY: f64 = 0.9;
const WARN_OCCUPANCY: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Added, and the buffer reached the batch size
    ShouldFlush,
    BufferFull,
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(usize),
    CircuitOpen,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Healthy,
    OccupancyWarning,
    EmergencyFlush,
    ForcedOpen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub written: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub failed_flushes: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    failed_flushes: AtomicU64,
}

struct FlushState {
    buffer: VecDeque<LogRecord>,
    breaker: CircuitBreaker,
}

/// In-memory buffer in front of the storage sink for direct mode.
///
/// Records are flushed when the buffer reaches `batch_size` or on the flush
/// timer, whichever comes first. Both paths share one flush lock so a record
/// is never written by two flushes. The buffer lock is only held to append or
/// snapshot, never across a write.
pub struct FlushEngine {
    sink: Arc<dyn RecordSink>,
    dead_letter: DeadLetterWriter,
    state: Mutex<FlushState>,
    flush_lock: tokio::sync::Mutex<()>,
    counters: Counters,
    batch_size: usize,
    max_size: usize,
    flush_interval: Duration,
    health_check_interval: Duration,
    max_downtime: Duration,
}

impl FlushEngine {
    pub fn new(sink: Arc<dyn RecordSink>, dead_letter: DeadLetterWriter, config: &PipelineConfig) -> Self {
        Self {
            sink,
            dead_letter,
            state: Mutex::new(FlushState {
                buffer: VecDeque::new(),
                breaker: CircuitBreaker::new(&config.circuit_breaker),
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            batch_size: config.buffer.batch_size.max(1),
            max_size: config.buffer.max_size.max(1),
            flush_interval: config.buffer.flush_interval,
            health_check_interval: config.health_check_interval,
            max_downtime: config.circuit_breaker.max_downtime,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FlushState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, record: LogRecord) -> AddOutcome {
        let mut state = self.lock_state();

        if state.breaker.poll(Instant::now()) == CircuitState::Open {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return AddOutcome::CircuitOpen;
        }
        if state.buffer.len() >= self.max_size {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return AddOutcome::BufferFull;
        }

        state.buffer.push_back(record);
        if state.buffer.len() >= self.batch_size {
            AddOutcome::ShouldFlush
        } else {
            AddOutcome::Added
        }
    }

    pub fn buffered(&self) -> usize {
        self.lock_state().buffer.len()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock_state().breaker.poll(Instant::now())
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Write everything currently buffered as one batch.
    ///
    /// Skipped while the breaker is open. A failed write puts the records back
    /// at the front of the buffer; records that no longer fit under the hard
    /// cap go to a dead-letter file.
    pub async fn flush(&self) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<LogRecord> = {
            let mut state = self.lock_state();
            if state.breaker.poll(Instant::now()) == CircuitState::Open {
                return FlushOutcome::CircuitOpen;
            }
            if state.buffer.is_empty() {
                return FlushOutcome::Empty;
            }
            state.buffer.drain(..).collect()
        };

        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                self.on_success(batch.len());
                FlushOutcome::Written(batch.len())
            }
            Err(e) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                let overflow = {
                    let mut state = self.lock_state();
                    let now = Instant::now();
                    if state.breaker.record_failure(now) {
                        warn!(
                            failures = state.breaker.consecutive_failures(),
                            error = %e,
                            "Circuit breaker opened after storage failures"
                        );
                    } else {
                        warn!(count = batch.len(), error = %e, "Flush failed, records requeued");
                    }

                    let room = self.max_size.saturating_sub(state.buffer.len());
                    let mut batch = batch;
                    let overflow = if batch.len() > room { batch.split_off(room) } else { Vec::new() };
                    for record in batch.into_iter().rev() {
                        state.buffer.push_front(record);
                    }
                    overflow
                };

                if !overflow.is_empty() {
                    self.dead_letter_records(&overflow).await;
                }
                FlushOutcome::Failed
            }
        }
    }

    /// Drain the whole buffer and attempt one write regardless of breaker state.
    /// If the write fails the drained records go to a dead-letter file.
    pub async fn emergency_flush(&self) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<LogRecord> = self.lock_state().buffer.drain(..).collect();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        warn!(count = batch.len(), "Emergency flush");
        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                self.on_success(batch.len());
                FlushOutcome::Written(batch.len())
            }
            Err(e) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.lock_state().breaker.record_failure(Instant::now());
                error!(count = batch.len(), error = %e, "Emergency flush failed");
                self.dead_letter_records(&batch).await;
                FlushOutcome::Failed
            }
        }
    }

    /// One health-monitor pass: enforce the downtime ceiling on a closed
    /// breaker, then the occupancy thresholds.
    pub async fn check_health(&self, now: Instant) -> HealthAction {
        let (downtime, breaker_state, occupancy) = {
            let mut state = self.lock_state();
            let breaker_state = state.breaker.poll(now);
            (
                state.breaker.downtime(now),
                breaker_state,
                state.buffer.len() as f64 / self.max_size as f64,
            )
        };

        // Only a closed breaker is forced. Open must be left to expire and
        // HalfOpen is waiting on its probe.
        if downtime > self.max_downtime && breaker_state == CircuitState::Closed {
            self.lock_state().breaker.force_open(now);
            error!(downtime = ?downtime, "Storage down past the ceiling, circuit forced open");
            self.emergency_flush().await;
            return HealthAction::ForcedOpen;
        }

        if occupancy > CRITICAL_OCCUPANCY {
            warn!(occupancy = %format!("{:.0}%", occupancy * 100.0), "Buffer nearly full");
            self.emergency_flush().await;
            HealthAction::EmergencyFlush
        } else if occupancy > WARN_OCCUPANCY {
            warn!(occupancy = %format!("{:.0}%", occupancy * 100.0), "Buffer occupancy high");
            HealthAction::OccupancyWarning
        } else {
            HealthAction::Healthy
        }
    }

    fn on_success(&self, count: usize) {
        self.counters.written.fetch_add(count as u64, Ordering::Relaxed);
        if self.lock_state().breaker.record_success() {
            info!("Storage recovered, circuit closed");
        }
        debug!(count, "Flushed records");
    }

    async fn dead_letter_records(&self, records: &[LogRecord]) {
        match self.dead_letter.write_records(records).await {
            Ok(_) => {
                self.counters.dead_lettered.fetch_add(records.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(records.len() as u64, Ordering::Relaxed);
                error!(count = records.len(), error = %e, "Failed to write dead-letter file, records lost");
            }
        }
    }

    /// Normalize listener output into the buffer until the queue completes.
    /// Flush timer and health monitor run as separate tasks; a final
    /// emergency flush drains the buffer on the way out.
    pub async fn run(self: Arc<Self>, queue: Arc<TextQueue>, normalizer: Arc<Normalizer>, cancel: CancellationToken) {
        info!(
            batch_size = self.batch_size,
            max_size = self.max_size,
            "Direct pipeline started"
        );

        let timers = cancel.child_token();
        let flush_task = {
            let engine = self.clone();
            let timers = timers.clone();
            tokio::spawn(async move {
                let mut interval = ticker(engine.flush_interval);
                loop {
                    tokio::select! {
                        _ = timers.cancelled() => break,
                        _ = interval.tick() => { engine.flush().await; }
                    }
                }
            })
        };
        let health_task = {
            let engine = self.clone();
            let timers = timers.clone();
            tokio::spawn(async move {
                let mut interval = ticker(engine.health_check_interval);
                loop {
                    tokio::select! {
                        _ = timers.cancelled() => break,
                        _ = interval.tick() => { engine.check_health(Instant::now()).await; }
                    }
                }
            })
        };

        loop {
            let text = tokio::select! {
                item = queue.pop() => match item {
                    Some(text) => text,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Some(text) = queue.try_pop() {
                        self.ingest(&normalizer, &text);
                    }
                    break;
                }
            };
            if self.ingest(&normalizer, &text) == Some(AddOutcome::ShouldFlush) {
                self.flush().await;
            }
        }

        timers.cancel();
        for task in [flush_task, health_task] {
            if let Err(e) = task.await {
                warn!(error = %e, "Direct pipeline timer task failed");
            }
        }

        self.emergency_flush().await;
        let stats = self.stats();
        info!(
            written = stats.written,
            dropped = stats.dropped,
            dead_lettered = stats.dead_lettered,
            "Direct pipeline stopped"
        );
    }

    fn ingest(&self, normalizer: &Normalizer, text: &str) -> Option<AddOutcome> {
        match normalizer.normalize(text) {
            Ok(record) => {
                let outcome = self.add(record);
                match outcome {
                    AddOutcome::BufferFull => debug!("Buffer full, record dropped"),
                    AddOutcome::CircuitOpen => debug!("Circuit open, record dropped"),
                    _ => {}
                }
                Some(outcome)
            }
            Err(e) => {
                debug!(error = %e, "Discarding unparseable payload");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BufferConfig, CircuitBreakerConfig};
    use crate::listener::queue::DropOldestQueue;
    use crate::record::LogLevel;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Sink that records batches and can be switched into failure.
    #[derive(Default)]
    struct TestSink {
        failing: AtomicBool,
        batches: Mutex<Vec<Vec<LogRecord>>>,
    }

    impl TestSink {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn written(&self) -> usize {
            self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
        }

        fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RecordSink for TestSink {
        async fn write_batch(&self, records: &[LogRecord]) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Database("sink unavailable".to_string()));
            }
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn test_config(batch_size: usize, max_size: usize) -> PipelineConfig {
        PipelineConfig {
            buffer: BufferConfig {
                batch_size,
                flush_interval: Duration::from_millis(50),
                max_size,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                open_duration: Duration::from_secs(120),
                max_downtime: Duration::from_secs(300),
            },
            health_check_interval: Duration::from_secs(30),
            ..PipelineConfig::default()
        }
    }

    fn setup(batch_size: usize, max_size: usize) -> (Arc<TestSink>, FlushEngine, tempfile::TempDir) {
        let sink = Arc::new(TestSink::default());
        let dir = tempfile::tempdir().unwrap();
        let engine = FlushEngine::new(
            sink.clone(),
            DeadLetterWriter::new(dir.path()),
            &test_config(batch_size, max_size),
        );
        (sink, engine, dir)
    }

    fn record(i: usize) -> LogRecord {
        LogRecord::new(format!("message {}", i), "test", LogLevel::Information)
    }

    fn dead_letter_files(dir: &tempfile::TempDir) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(dir.path())
            .map(|entries| entries.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_add_signals_flush_at_batch_size() {
        let (_sink, engine, _dir) = setup(3, 100);
        assert_eq!(engine.add(record(1)), AddOutcome::Added);
        assert_eq!(engine.add(record(2)), AddOutcome::Added);
        assert_eq!(engine.add(record(3)), AddOutcome::ShouldFlush);
    }

    #[tokio::test]
    async fn test_flush_writes_snapshot_once() {
        let (sink, engine, _dir) = setup(10, 100);
        for i in 0..4 {
            engine.add(record(i));
        }

        assert_eq!(engine.flush().await, FlushOutcome::Written(4));
        assert_eq!(engine.flush().await, FlushOutcome::Empty);
        assert_eq!(sink.written(), 4);
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(engine.buffered(), 0);
    }

    #[tokio::test]
    async fn test_buffer_full_drops_record() {
        let (_sink, engine, _dir) = setup(100, 2);
        engine.add(record(1));
        engine.add(record(2));
        assert_eq!(engine.add(record(3)), AddOutcome::BufferFull);
        assert_eq!(engine.buffered(), 2);
        assert_eq!(engine.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let (sink, engine, _dir) = setup(100, 100);
        engine.add(record(1));
        engine.add(record(2));

        sink.set_failing(true);
        assert_eq!(engine.flush().await, FlushOutcome::Failed);
        assert_eq!(engine.buffered(), 2);

        engine.add(record(3));
        sink.set_failing(false);
        assert_eq!(engine.flush().await, FlushOutcome::Written(3));

        let batches = sink.batches.lock().unwrap();
        let messages: Vec<&str> = batches[0].iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["message 1", "message 2", "message 3"]);
    }

    #[tokio::test]
    async fn test_five_failures_open_circuit_and_shed_new_records() {
        let (sink, engine, _dir) = setup(100, 100);
        engine.add(record(0));
        sink.set_failing(true);

        for _ in 0..4 {
            assert_eq!(engine.flush().await, FlushOutcome::Failed);
            assert_eq!(engine.circuit_state(), CircuitState::Closed);
        }
        assert_eq!(engine.flush().await, FlushOutcome::Failed);
        assert_eq!(engine.circuit_state(), CircuitState::Open);

        assert_eq!(engine.add(record(1)), AddOutcome::CircuitOpen);
        assert_eq!(engine.flush().await, FlushOutcome::CircuitOpen);
        assert_eq!(engine.stats().failed_flushes, 5);
    }

    /// Fails every write, refilling the engine while the write is in flight.
    #[derive(Default)]
    struct RefillingSink {
        engine: std::sync::OnceLock<std::sync::Weak<FlushEngine>>,
    }

    #[async_trait]
    impl RecordSink for RefillingSink {
        async fn write_batch(&self, _records: &[LogRecord]) -> Result<(), StorageError> {
            if let Some(engine) = self.engine.get().and_then(|weak| weak.upgrade()) {
                engine.add(record(100));
                engine.add(record(101));
            }
            Err(StorageError::Database("sink unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_requeue_overflow_is_dead_lettered() {
        let sink = Arc::new(RefillingSink::default());
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FlushEngine::new(
            sink.clone(),
            DeadLetterWriter::new(dir.path()),
            &test_config(100, 3),
        ));
        sink.engine.set(Arc::downgrade(&engine)).unwrap();
        for i in 0..3 {
            engine.add(record(i));
        }

        assert_eq!(engine.flush().await, FlushOutcome::Failed);
        assert_eq!(engine.buffered(), 3);
        assert_eq!(engine.stats().dead_lettered, 2);
        assert_eq!(dead_letter_files(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit() {
        let sink = Arc::new(TestSink::default());
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(100, 100);
        config.circuit_breaker.open_duration = Duration::ZERO;
        let engine = FlushEngine::new(sink.clone(), DeadLetterWriter::new(dir.path()), &config);

        engine.add(record(1));
        sink.set_failing(true);
        for _ in 0..5 {
            engine.flush().await;
        }
        assert_eq!(engine.circuit_state(), CircuitState::HalfOpen);

        sink.set_failing(false);
        assert_eq!(engine.flush().await, FlushOutcome::Written(1));
        assert_eq!(engine.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_emergency_flush_failure_writes_dead_letter() {
        let (sink, engine, dir) = setup(100, 100);
        for i in 0..5 {
            engine.add(record(i));
        }
        sink.set_failing(true);

        assert_eq!(engine.emergency_flush().await, FlushOutcome::Failed);
        assert_eq!(engine.buffered(), 0);
        assert_eq!(engine.stats().dead_lettered, 5);

        let files = dead_letter_files(&dir);
        assert_eq!(files.len(), 1);
        let parsed: Vec<LogRecord> = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
        assert_eq!(parsed.len(), 5);
    }

    #[tokio::test]
    async fn test_health_forces_open_after_max_downtime() {
        let (sink, engine, dir) = setup(100, 100);
        engine.add(record(1));
        sink.set_failing(true);
        assert_eq!(engine.flush().await, FlushOutcome::Failed);

        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(engine.check_health(later).await, HealthAction::ForcedOpen);
        assert_eq!(engine.circuit_state(), CircuitState::Open);
        assert_eq!(engine.buffered(), 0);
        assert_eq!(dead_letter_files(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_forced_open_expires_and_recovers() {
        let sink = Arc::new(TestSink::default());
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(100, 100);
        config.circuit_breaker.open_duration = Duration::from_millis(100);
        config.circuit_breaker.max_downtime = Duration::from_millis(200);
        let engine = FlushEngine::new(sink.clone(), DeadLetterWriter::new(dir.path()), &config);

        engine.add(record(1));
        sink.set_failing(true);
        assert_eq!(engine.flush().await, FlushOutcome::Failed);
        let past_ceiling = Instant::now() + Duration::from_millis(300);
        assert_eq!(engine.check_health(past_ceiling).await, HealthAction::ForcedOpen);
        assert_eq!(engine.circuit_state(), CircuitState::Open);

        // Ticks while open must not restart the open period
        sink.set_failing(false);
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert_ne!(engine.check_health(Instant::now()).await, HealthAction::ForcedOpen);
        }
        assert_eq!(engine.circuit_state(), CircuitState::HalfOpen);
        assert_ne!(engine.check_health(Instant::now()).await, HealthAction::ForcedOpen);

        assert_eq!(engine.add(record(2)), AddOutcome::Added);
        assert_eq!(engine.flush().await, FlushOutcome::Written(1));
        assert_eq!(engine.circuit_state(), CircuitState::Closed);
        assert_eq!(engine.check_health(Instant::now()).await, HealthAction::Healthy);
        assert_eq!(engine.add(record(3)), AddOutcome::Added);
    }

    #[tokio::test]
    async fn test_idle_engine_is_never_down() {
        let (_sink, engine, _dir) = setup(100, 100);
        let much_later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(engine.check_health(much_later).await, HealthAction::Healthy);
    }

    #[tokio::test]
    async fn test_health_occupancy_thresholds() {
        let (sink, engine, _dir) = setup(1000, 10);
        for i in 0..8 {
            engine.add(record(i));
        }
        assert_eq!(engine.check_health(Instant::now()).await, HealthAction::OccupancyWarning);
        assert_eq!(engine.buffered(), 8);

        for i in 8..10 {
            engine.add(record(i));
        }
        assert_eq!(engine.check_health(Instant::now()).await, HealthAction::EmergencyFlush);
        assert_eq!(engine.buffered(), 0);
        assert_eq!(sink.written(), 10);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_flushes_on_exit() {
        let sink = Arc::new(TestSink::default());
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FlushEngine::new(
            sink.clone(),
            DeadLetterWriter::new(dir.path()),
            &test_config(2, 100),
        ));
        let queue: Arc<TextQueue> = Arc::new(DropOldestQueue::new(16));
        for text in ["ERROR: one", "two", "   ", "{\"message\":\"three\"}"] {
            queue.push(text.to_string());
        }
        queue.close();

        engine
            .clone()
            .run(queue, Arc::new(Normalizer::default()), CancellationToken::new())
            .await;

        assert_eq!(sink.written(), 3);
        assert_eq!(engine.buffered(), 0);
    }
}
