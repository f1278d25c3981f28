use crate::notify::NotificationSink;
use crate::record::{local_now, parse_correlation_id, LogLevel, LogRecord};
use crate::storage::{LogStatistics, SearchQuery, SearchResults, Storage, StorageError};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const UNKNOWN_SOURCE: &str = "Unknown";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("record {0} already exists")]
    Duplicate(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A single record submitted through the API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLog {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub level_id: Option<i64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Query and single-record ingest on top of storage.
pub struct LogService {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn NotificationSink>,
}

impl LogService {
    pub fn new(storage: Arc<dyn Storage>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { storage, notifier }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Validate, store and announce one record.
    pub async fn add_log(&self, new: NewLog) -> Result<LogRecord, ServiceError> {
        let message = new.message.trim();
        if message.is_empty() {
            return Err(ServiceError::EmptyMessage);
        }

        let source = new
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SOURCE);
        let level = new
            .level_id
            .and_then(LogLevel::from_id)
            .unwrap_or_default();

        let record = LogRecord {
            unique_id: Uuid::new_v4(),
            correlation_id: parse_correlation_id(new.correlation_id.as_deref()),
            message: message.to_string(),
            source: source.to_string(),
            level,
            timestamp: local_now(),
        };

        if !self.storage.insert_one(&record).await? {
            return Err(ServiceError::Duplicate(record.unique_id));
        }
        self.notifier.push(&record);
        Ok(record)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults, ServiceError> {
        Ok(self.storage.search(query).await?)
    }

    pub async fn statistics(&self) -> Result<LogStatistics, ServiceError> {
        Ok(self.storage.statistics().await?)
    }

    pub async fn get(&self, unique_id: Uuid) -> Result<Option<LogRecord>, ServiceError> {
        Ok(self.storage.get_by_unique_id(unique_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::storage::DuckDbStorage;

    async fn setup() -> (LogService, BroadcastNotifier) {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        let notifier = BroadcastNotifier::new(16);
        let service = LogService::new(Arc::new(storage), Arc::new(notifier.clone()));
        (service, notifier)
    }

    #[tokio::test]
    async fn test_add_log_applies_defaults_and_notifies() {
        let (service, notifier) = setup().await;
        let mut rx = notifier.subscribe();

        let record = service
            .add_log(NewLog {
                message: "  cache warmed  ".to_string(),
                source: Some("   ".to_string()),
                level_id: Some(42),
                correlation_id: Some("not-a-uuid".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(record.message, "cache warmed");
        assert_eq!(record.source, "Unknown");
        assert_eq!(record.level, LogLevel::Information);
        assert!(record.correlation_id.is_none());

        assert_eq!(rx.recv().await.unwrap().unique_id, record.unique_id);
        assert_eq!(service.get(record.unique_id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_blank_message_rejected() {
        let (service, _notifier) = setup().await;
        let err = service
            .add_log(NewLog {
                message: " \n ".to_string(),
                ..NewLog::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmptyMessage));
    }

    #[tokio::test]
    async fn test_valid_level_and_correlation_kept() {
        let (service, _notifier) = setup().await;
        let correlation = Uuid::new_v4();
        let record = service
            .add_log(NewLog {
                message: "payment declined".to_string(),
                source: Some("billing".to_string()),
                level_id: Some(4),
                correlation_id: Some(correlation.to_string()),
            })
            .await
            .unwrap();
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.correlation_id, Some(correlation));
    }
}
