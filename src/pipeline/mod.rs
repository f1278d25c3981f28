pub mod circuit;
pub mod consumer;
pub mod dead_letter;
pub mod flush;
pub mod forwarder;
pub mod group;
pub mod retention;
pub mod retry;
pub mod triage;

pub use circuit::{CircuitBreaker, CircuitState};
pub use consumer::BatchConsumer;
pub use dead_letter::DeadLetterWriter;
pub use flush::FlushEngine;
pub use forwarder::{run_forwarder, ForwarderSettings};
pub use group::{EntryHandler, GroupRunner};
pub use retention::run_retention;
pub use retry::RetryHandler;
pub use triage::FailedEntryHandler;

use crate::broker::{BrokerError, RawMessage};
use crate::normalize::{Normalizer, ParseFailure};
use crate::record::LogRecord;
use crate::storage::StorageError;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// Namespace for record ids derived from broker entries.
const ENTRY_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_7169_2d65_6e74_7279_2d72_6563_6f72);

/// Errors that can occur during pipeline operation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Consumer name that stays stable across restarts on the same host, so a
/// restarted consumer finds its own pending entries.
pub fn consumer_name(group: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "consumer".to_string());
    format!("{}-{}", group, host)
}

/// Record id for a broker entry. Every delivery of the same entry maps to the
/// same id, so storage skips a batch that is written twice.
pub fn entry_record_id(entry: &RawMessage) -> Uuid {
    let name = format!("{}:{}", entry.id, entry.appended_at.timestamp_millis());
    Uuid::new_v5(&ENTRY_NAMESPACE, name.as_bytes())
}

/// Normalize an entry's payload under its entry-derived record id.
pub(crate) fn normalize_entry(normalizer: &Normalizer, entry: &RawMessage) -> Result<LogRecord, ParseFailure> {
    normalizer.normalize(&entry.payload).map(|mut record| {
        record.unique_id = entry_record_id(entry);
        record
    })
}

/// Interval whose first tick is one full period away.
pub(crate) fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Await a worker for at most `grace`, then give up on it.
pub async fn stop_worker<T>(name: &str, handle: JoinHandle<T>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(value)) => {
            debug!(worker = name, "Worker stopped");
            Some(value)
        }
        Ok(Err(e)) => {
            warn!(worker = name, error = %e, "Worker task failed");
            None
        }
        Err(_) => {
            warn!(worker = name, grace = ?grace, "Worker did not stop within grace period");
            None
        }
    }
}
