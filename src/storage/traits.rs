use super::query::{SearchQuery, SearchResults};
use crate::record::{LogLevel, LogRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Insert a single record. Returns false if its unique id is already stored.
    async fn insert_one(&self, record: &LogRecord) -> Result<bool, StorageError>;

    /// Insert every record in one transaction. Records whose unique id is
    /// already stored are skipped. Consumers derive ids from broker entries,
    /// so a redelivered batch stores nothing new.
    async fn insert_batch(&self, records: &[LogRecord]) -> Result<(), StorageError>;

    async fn get_by_unique_id(&self, unique_id: Uuid) -> Result<Option<LogRecord>, StorageError>;

    async fn search(&self, query: &SearchQuery) -> Result<SearchResults, StorageError>;

    async fn update_message(&self, unique_id: Uuid, message: &str) -> Result<bool, StorageError>;

    async fn delete_by_unique_id(&self, unique_id: Uuid) -> Result<bool, StorageError>;

    /// Delete records with a timestamp strictly before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn statistics(&self) -> Result<LogStatistics, StorageError>;
}

/// The write half of storage that batch consumers depend on.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_batch(&self, records: &[LogRecord]) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: Storage + ?Sized> RecordSink for S {
    async fn write_batch(&self, records: &[LogRecord]) -> Result<(), StorageError> {
        self.insert_batch(records).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStatistics {
    pub total: u64,
    pub by_level: Vec<LevelCount>,
    pub top_sources: Vec<SourceCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelCount {
    pub level: LogLevel,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("storage connection lock poisoned")]
    LockPoisoned,
}
