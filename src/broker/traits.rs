use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broker-assigned id, monotonically increasing within the stream.
pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    New,
    Success,
    Failed,
    Retry,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::New => "New",
            EntryStatus::Success => "Success",
            EntryStatus::Failed => "Failed",
            EntryStatus::Retry => "Retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "New" => Some(EntryStatus::New),
            "Success" => Some(EntryStatus::Success),
            "Failed" => Some(EntryStatus::Failed),
            "Retry" => Some(EntryStatus::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of durability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: EntryId,
    pub payload: String,
    pub status: EntryStatus,
    pub attempts: u32,
    pub error_info: Option<String>,
    pub appended_at: DateTime<Utc>,
}

/// Where a newly created group's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver everything already in the stream
    Beginning,
    /// Deliver only entries appended after creation
    End,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn init_schema(&self) -> Result<(), BrokerError>;

    async fn append(
        &self,
        payload: &str,
        status: EntryStatus,
        attempts: u32,
        error_info: Option<&str>,
    ) -> Result<EntryId, BrokerError>;

    /// Create `group` if missing. Only entries whose status is in `statuses`
    /// are delivered to it; an empty slice delivers every status. Returns
    /// false when the group already existed.
    async fn ensure_group(
        &self,
        group: &str,
        start: StartPosition,
        statuses: &[EntryStatus],
    ) -> Result<bool, BrokerError>;

    /// Claim up to `batch_size` never-delivered entries for `consumer`,
    /// waiting up to `block` when none are available.
    async fn read(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError>;

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<u64, BrokerError>;

    async fn pending(&self, group: &str) -> Result<u64, BrokerError>;

    async fn pending_for(&self, group: &str, consumer: &str) -> Result<Vec<RawMessage>, BrokerError>;

    /// Reassign entries pending longer than `min_idle` to `consumer`.
    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError>;

    /// Keep only the newest `max_length` entries. Returns the number removed.
    async fn trim(&self, max_length: u64) -> Result<u64, BrokerError>;

    async fn delete(&self, ids: &[EntryId]) -> Result<u64, BrokerError>;

    async fn len(&self) -> Result<u64, BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("database error: {0}")]
    Database(String),

    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("consumer group '{0}' does not exist")]
    UnknownGroup(String),

    #[error("corrupt stream entry: {0}")]
    CorruptEntry(String),

    #[error("broker connection lock poisoned")]
    LockPoisoned,
}
