use super::group::reappend;
use super::{consumer_name, normalize_entry, ticker, PipelineError};
use crate::broker::{Broker, EntryId, EntryStatus, RawMessage, StartPosition};
use crate::config::types::{ConsumerGroupConfig, PipelineConfig};
use crate::normalize::{Normalizer, ParseFailure};
use crate::record::LogRecord;
use crate::storage::RecordSink;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Statuses delivered to the raw group
const RAW_STATUSES: [EntryStatus; 1] = [EntryStatus::New];

/// A buffered broker entry and what the normalizer made of it.
#[derive(Debug)]
struct BatchItem {
    entry: RawMessage,
    parsed: Result<LogRecord, ParseFailure>,
    /// Failed flushes this item has been part of
    flush_failures: u32,
}

#[derive(Default)]
struct BufferState {
    items: Vec<BatchItem>,
    /// Ids buffered or being flushed; recovery skips these
    in_flight: HashSet<EntryId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub read: u64,
    pub stored: u64,
    pub acked: u64,
    /// Entries acknowledged without a stored record because they failed to normalize
    pub poison_acked: u64,
    /// Entries handed to the retry group after repeated flush failures
    pub escalated: u64,
    pub failed_flushes: u64,
}

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    stored: AtomicU64,
    acked: AtomicU64,
    poison_acked: AtomicU64,
    escalated: AtomicU64,
    failed_flushes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub stored: usize,
    pub acked: u64,
    pub poison: usize,
    pub escalated: usize,
    pub requeued: usize,
}

/// Reads the raw group, normalizes entries into an in-memory batch and writes
/// each batch to storage, acknowledging broker entries only after the write
/// succeeds.
pub struct BatchConsumer {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn RecordSink>,
    normalizer: Arc<Normalizer>,
    group: ConsumerGroupConfig,
    consumer: String,
    max_batch_size: usize,
    flush_interval: Duration,
    read_error_delay: Duration,
    shutdown_grace: Duration,
    state: Mutex<BufferState>,
    flush_lock: tokio::sync::Mutex<()>,
    counters: Counters,
}

impl BatchConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn RecordSink>,
        normalizer: Arc<Normalizer>,
        group: ConsumerGroupConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        let consumer = consumer_name(&group.name);
        Self {
            broker,
            sink,
            normalizer,
            group,
            consumer,
            max_batch_size: pipeline.max_batch_size.max(1),
            flush_interval: pipeline.flush_interval,
            read_error_delay: pipeline.read_error_delay,
            shutdown_grace: pipeline.shutdown_grace,
            state: Mutex::new(BufferState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Override the host-derived consumer name.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer = name.into();
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn buffered(&self) -> usize {
        self.lock_state().items.len()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            read: self.counters.read.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            poison_acked: self.counters.poison_acked.load(Ordering::Relaxed),
            escalated: self.counters.escalated.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
        }
    }

    pub async fn init(&self) -> Result<(), PipelineError> {
        let created = self
            .broker
            .ensure_group(&self.group.name, StartPosition::Beginning, &RAW_STATUSES)
            .await?;
        if created {
            info!(group = %self.group.name, "Created consumer group");
        }
        Ok(())
    }

    /// Normalize and buffer entries that are not already buffered.
    pub fn buffer(&self, entries: Vec<RawMessage>) -> usize {
        let mut state = self.lock_state();
        let mut added = 0;
        for entry in entries {
            if !state.in_flight.insert(entry.id) {
                continue;
            }
            let parsed = normalize_entry(&self.normalizer, &entry);
            state.items.push(BatchItem {
                entry,
                parsed,
                flush_failures: 0,
            });
            added += 1;
        }
        self.counters.read.fetch_add(added as u64, Ordering::Relaxed);
        added
    }

    /// One broker read; flushes when the buffer reaches the batch size.
    pub async fn read_once(&self) -> Result<usize, PipelineError> {
        let entries = self
            .broker
            .read(&self.group.name, &self.consumer, self.group.batch_size, self.group.block_time)
            .await?;
        let added = self.buffer(entries);
        if self.buffered() >= self.max_batch_size {
            self.flush().await;
        }
        Ok(added)
    }

    /// Re-buffer this consumer's own pending entries, then entries idle past
    /// the ack timeout from any consumer.
    pub async fn recover(&self) -> Result<usize, PipelineError> {
        let own = self.broker.pending_for(&self.group.name, &self.consumer).await?;
        let mut recovered = self.buffer(own);

        let claimed = self
            .broker
            .claim(&self.group.name, &self.consumer, self.group.ack_timeout)
            .await?;
        recovered += self.buffer(claimed);

        if recovered > 0 {
            info!(group = %self.group.name, count = recovered, "Recovered pending entries");
        }
        Ok(recovered)
    }

    /// Write the current buffer as one batch.
    ///
    /// Entries that failed to normalize are re-appended as `Failed` and
    /// acknowledged with the batch once it is stored, or at once when the
    /// batch has no valid records. On a write failure nothing in the batch is
    /// acknowledged; items go back to the buffer, except those that have now
    /// failed `max_retries` flushes, which are handed to the retry group
    /// (or the failed group when they never parsed).
    pub async fn flush(&self) -> FlushSummary {
        let _guard = self.flush_lock.lock().await;

        let mut items = std::mem::take(&mut self.lock_state().items);
        if items.is_empty() {
            return FlushSummary::default();
        }
        items.sort_by_key(|item| item.entry.id);

        let mut summary = FlushSummary::default();
        let mut ack_ids: Vec<EntryId> = Vec::new();
        let mut keep: Vec<BatchItem> = Vec::new();
        let (valid, poison): (Vec<BatchItem>, Vec<BatchItem>) =
            items.into_iter().partition(|item| item.parsed.is_ok());

        let records: Vec<LogRecord> = valid
            .iter()
            .filter_map(|item| item.parsed.as_ref().ok().cloned())
            .collect();

        if records.is_empty() {
            self.settle_poison(poison, &mut ack_ids, &mut keep, &mut summary).await;
            debug!(group = %self.group.name, poison = summary.poison, "Batch had no valid records");
        } else {
            match self.sink.write_batch(&records).await {
                Ok(()) => {
                    summary.stored = records.len();
                    self.counters.stored.fetch_add(records.len() as u64, Ordering::Relaxed);
                    ack_ids.extend(valid.iter().map(|item| item.entry.id));
                    self.settle_poison(poison, &mut ack_ids, &mut keep, &mut summary).await;
                }
                Err(e) => {
                    self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    warn!(group = %self.group.name, count = records.len(), error = %e, "Batch write failed");

                    let error_info = e.to_string();
                    let mut exhausted = Vec::new();
                    for mut item in valid {
                        item.flush_failures += 1;
                        if item.flush_failures >= self.group.max_retries
                            && reappend(
                                self.broker.as_ref(),
                                &item.entry,
                                EntryStatus::Retry,
                                item.entry.attempts + 1,
                                &error_info,
                            )
                            .await
                        {
                            ack_ids.push(item.entry.id);
                            summary.escalated += 1;
                        } else {
                            keep.push(item);
                        }
                    }

                    // Unparseable entries stay with their batch until it is settled
                    for mut item in poison {
                        item.flush_failures += 1;
                        if item.flush_failures >= self.group.max_retries {
                            exhausted.push(item);
                        } else {
                            keep.push(item);
                        }
                    }
                    self.settle_poison(exhausted, &mut ack_ids, &mut keep, &mut summary).await;
                }
            }
        }

        if !ack_ids.is_empty() {
            match self.broker.ack(&self.group.name, &ack_ids).await {
                Ok(count) => {
                    summary.acked = count;
                    self.counters.acked.fetch_add(count, Ordering::Relaxed);
                }
                Err(e) => {
                    // Entries stay pending and come back through claim
                    error!(group = %self.group.name, count = ack_ids.len(), error = %e, "Ack failed");
                }
            }
        }
        if summary.poison > 0 {
            self.counters.poison_acked.fetch_add(summary.poison as u64, Ordering::Relaxed);
            warn!(group = %self.group.name, count = summary.poison, "Acknowledged unparseable entries");
        }
        if summary.escalated > 0 {
            self.counters.escalated.fetch_add(summary.escalated as u64, Ordering::Relaxed);
            warn!(group = %self.group.name, count = summary.escalated, "Moved entries to retry after repeated flush failures");
        }

        summary.requeued = keep.len();
        {
            let mut state = self.lock_state();
            for id in &ack_ids {
                state.in_flight.remove(id);
            }
            let newer = std::mem::take(&mut state.items);
            state.items = keep;
            state.items.extend(newer);
        }

        if summary.stored > 0 {
            debug!(group = %self.group.name, stored = summary.stored, acked = summary.acked, "Flushed batch");
        }
        summary
    }

    /// Re-append unparseable entries as `Failed` and mark them for ack.
    /// Entries whose re-append fails stay buffered.
    async fn settle_poison(
        &self,
        poison: Vec<BatchItem>,
        ack_ids: &mut Vec<EntryId>,
        keep: &mut Vec<BatchItem>,
        summary: &mut FlushSummary,
    ) {
        for item in poison {
            let info = match &item.parsed {
                Err(failure) => format!("parse failure: {}", failure),
                Ok(_) => continue,
            };
            if reappend(self.broker.as_ref(), &item.entry, EntryStatus::Failed, item.entry.attempts, &info).await {
                ack_ids.push(item.entry.id);
                summary.poison += 1;
            } else {
                keep.push(item);
            }
        }
    }

    /// Consume until cancelled, then flush what is left within the grace period.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        while let Err(e) = self.init().await {
            warn!(group = %self.group.name, error = %e, "Failed to create consumer group, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.read_error_delay) => {}
            }
        }
        if let Err(e) = self.recover().await {
            warn!(group = %self.group.name, error = %e, "Startup recovery failed");
        }

        info!(group = %self.group.name, consumer = %self.consumer, "Batch consumer started");

        let timers = cancel.child_token();
        let flush_task = {
            let consumer = self.clone();
            let timers = timers.clone();
            tokio::spawn(async move {
                let mut interval = ticker(consumer.flush_interval);
                loop {
                    tokio::select! {
                        _ = timers.cancelled() => break,
                        _ = interval.tick() => { consumer.flush().await; }
                    }
                }
            })
        };
        let claim_task = {
            let consumer = self.clone();
            let timers = timers.clone();
            tokio::spawn(async move {
                let mut interval = ticker(consumer.group.ack_timeout);
                loop {
                    tokio::select! {
                        _ = timers.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = consumer.recover().await {
                                warn!(group = %consumer.group.name, error = %e, "Claiming idle entries failed");
                            }
                        }
                    }
                }
            })
        };

        while !cancel.is_cancelled() {
            if let Err(e) = self.read_once().await {
                warn!(group = %self.group.name, error = %e, "Broker read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.read_error_delay) => {}
                }
            }
        }

        timers.cancel();
        for task in [flush_task, claim_task] {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer timer task failed");
            }
        }

        if tokio::time::timeout(self.shutdown_grace, self.flush()).await.is_err() {
            warn!(group = %self.group.name, buffered = self.buffered(), "Final flush did not finish within grace period");
        }

        let stats = self.stats();
        info!(
            group = %self.group.name,
            read = stats.read,
            stored = stats.stored,
            poison_acked = stats.poison_acked,
            "Batch consumer stopped"
        );
    }
}
