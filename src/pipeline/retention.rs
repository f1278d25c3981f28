use super::{ticker, PipelineError};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Delete records older than `retention` as of `now`.
pub async fn purge_once(storage: &dyn Storage, retention: Duration, now: DateTime<Utc>) -> Result<u64, PipelineError> {
    let horizon = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(365_000));
    let cutoff = now.checked_sub_signed(horizon).unwrap_or(DateTime::<Utc>::MIN_UTC);
    Ok(storage.delete_older_than(cutoff).await?)
}

pub async fn run_retention(storage: Arc<dyn Storage>, retention: Duration, every: Duration, cancel: CancellationToken) {
    info!(retention = ?retention, every = ?every, "Retention task started");
    let mut interval = ticker(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match purge_once(storage.as_ref(), retention, Utc::now()).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Removed records past retention"),
                    Err(e) => warn!(error = %e, "Retention pass failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, LogRecord};
    use crate::storage::DuckDbStorage;

    #[tokio::test]
    async fn test_purge_removes_only_old_records() {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();

        let mut old = LogRecord::new("old", "svc", LogLevel::Information);
        old.timestamp = old.timestamp - chrono::Duration::days(40);
        let fresh = LogRecord::new("fresh", "svc", LogLevel::Information);
        storage.insert_batch(&[old.clone(), fresh.clone()]).await.unwrap();

        let removed = purge_once(&storage, Duration::from_secs(30 * 86_400), Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_by_unique_id(old.unique_id).await.unwrap().is_none());
        assert!(storage.get_by_unique_id(fresh.unique_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let storage: Arc<dyn Storage> = Arc::new(DuckDbStorage::in_memory().unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_retention(
            storage,
            Duration::from_secs(60),
            Duration::from_secs(3600),
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
