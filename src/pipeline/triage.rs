use super::dead_letter::DeadLetterWriter;
use super::group::EntryHandler;
use crate::broker::{EntryId, RawMessage};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const PREVIEW_CHARS: usize = 200;

/// Terminal handler for the failed group: logs each entry and moves the batch
/// to a dead-letter file.
pub struct FailedEntryHandler {
    dead_letter: DeadLetterWriter,
}

impl FailedEntryHandler {
    pub fn new(dead_letter: DeadLetterWriter) -> Self {
        Self { dead_letter }
    }
}

#[async_trait]
impl EntryHandler for FailedEntryHandler {
    async fn handle(&self, entries: Vec<RawMessage>, _cancel: &CancellationToken) -> Vec<EntryId> {
        for entry in &entries {
            let preview: String = entry.payload.chars().take(PREVIEW_CHARS).collect();
            warn!(
                entry = entry.id,
                attempts = entry.attempts,
                error = entry.error_info.as_deref().unwrap_or("unknown"),
                payload = %preview,
                "Failed entry"
            );
        }

        match self.dead_letter.write_entries(&entries).await {
            Ok(_) => entries.iter().map(|entry| entry.id).collect(),
            Err(e) => {
                error!(count = entries.len(), error = %e, "Could not dead-letter failed entries");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EntryStatus;
    use chrono::Utc;

    fn failed(id: EntryId) -> RawMessage {
        RawMessage {
            id,
            payload: format!("payload {}", id),
            status: EntryStatus::Failed,
            attempts: 3,
            error_info: Some("max retries (3) exceeded".to_string()),
            appended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dead_letters_then_acks() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FailedEntryHandler::new(DeadLetterWriter::new(dir.path()));

        let ids = handler.handle(vec![failed(4), failed(9)], &CancellationToken::new()).await;
        assert_eq!(ids, vec![4, 9]);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_dir_acks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let handler = FailedEntryHandler::new(DeadLetterWriter::new(blocker.join("dead-letter")));

        let ids = handler.handle(vec![failed(1)], &CancellationToken::new()).await;
        assert!(ids.is_empty());
    }
}
