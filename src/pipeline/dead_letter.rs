use super::PipelineError;
use crate::broker::RawMessage;
use crate::record::LogRecord;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Writes undeliverable batches as one JSON document per file.
#[derive(Debug, Clone)]
pub struct DeadLetterWriter {
    dir: PathBuf,
}

impl DeadLetterWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `failed-batch-<UTC>-<random>.json` holding the records.
    pub async fn write_records(&self, records: &[LogRecord]) -> Result<PathBuf, PipelineError> {
        self.write("failed-batch", records).await
    }

    /// `failed-entries-<UTC>-<random>.json` holding raw broker entries.
    pub async fn write_entries(&self, entries: &[RawMessage]) -> Result<PathBuf, PipelineError> {
        self.write("failed-entries", entries).await
    }

    async fn write<T: Serialize>(&self, prefix: &str, items: &[T]) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}.json",
            prefix,
            Utc::now().format("%Y%m%d-%H%M%S"),
            &suffix[..8]
        );
        let path = self.dir.join(name);

        let body = serde_json::to_vec_pretty(items)?;
        tokio::fs::write(&path, body).await?;

        tracing::warn!(path = %path.display(), count = items.len(), "Wrote dead-letter file");
        Ok(path)
    }
}
