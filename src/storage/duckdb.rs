use super::query::{self, SearchQuery, SearchResults, PaginationInfo, RECORD_COLUMNS};
use super::traits::{LevelCount, LogStatistics, SourceCount, Storage, StorageError};
use crate::record::{reconstruct_timestamp, LogLevel, LogRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract PID from a DuckDB lock error: "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove the lock file of a dead process. The WAL holds committed writes
/// that are not yet checkpointed and is left for DuckDB to replay.
fn remove_lock_file(db_path: &Path) -> std::io::Result<()> {
    let path = PathBuf::from(format!("{}.lock", db_path.display()));
    if path.exists() {
        std::fs::remove_file(&path)?;
        tracing::info!("Removed stale lock file: {}", path.display());
    }
    Ok(())
}

/// Open a DuckDB file, clearing a lock left behind by a dead process.
pub(crate) fn open_connection(path: &Path) -> duckdb::Result<Connection> {
    let err = match Connection::open(path) {
        Ok(conn) => return Ok(conn),
        Err(e) => e,
    };

    let error_msg = err.to_string();
    if !error_msg.contains("Could not set lock") {
        return Err(err);
    }

    tracing::warn!("Database lock detected: {}", error_msg);
    let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
        return Err(err);
    };

    if is_process_running(pid) {
        tracing::error!("Process {} is still running, cannot acquire lock", pid);
        return Err(err);
    }

    tracing::warn!("Process {} is not running, removing stale lock file", pid);
    if let Err(io_err) = remove_lock_file(path) {
        tracing::error!("Failed to remove lock file: {}", io_err);
        return Err(err);
    }

    Connection::open(path)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// DuckDB implementation of the Storage trait
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        ensure_parent_dir(path).map_err(|e| {
            StorageError::Database(format!("failed to create directory for '{}': {}", path.display(), e))
        })?;

        let conn = open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

fn find_id(conn: &Connection, unique_id: &str) -> Result<Option<i64>, StorageError> {
    let mut stmt = conn.prepare("SELECT id FROM logs WHERE unique_id = ?")?;
    let mut rows = stmt.query(params![unique_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn index_message(conn: &Connection, log_id: i64, message: &str) -> Result<(), StorageError> {
    let mut stmt = conn.prepare("INSERT INTO logs_terms (term, log_id) VALUES (?, ?)")?;
    for term in query::tokenize(message) {
        stmt.execute(params![term, log_id])?;
    }
    Ok(())
}

/// Insert one record and its index terms. Caller owns the transaction.
fn insert_record(conn: &Connection, record: &LogRecord) -> Result<bool, StorageError> {
    let unique_id = record.unique_id.to_string();
    if find_id(conn, &unique_id)?.is_some() {
        return Ok(false);
    }

    let log_id: i64 = conn.query_row(
        "INSERT INTO logs (unique_id, correlation_id, timestamp, offset_minutes, level, message, source)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
        params![
            unique_id,
            record.correlation_id.map(|id| id.to_string()),
            record.epoch_seconds(),
            record.offset_minutes(),
            record.level.id() as i32,
            record.message,
            record.source,
        ],
        |row| row.get(0),
    )?;

    index_message(conn, log_id, &record.message)?;
    Ok(true)
}

fn conversion_error(column: usize, kind: duckdb::types::Type, msg: &str) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())),
    )
}

/// Map a row selected with `RECORD_COLUMNS`.
fn row_to_record(row: &duckdb::Row<'_>) -> duckdb::Result<LogRecord> {
    let unique_id = Uuid::parse_str(&row.get::<_, String>(0)?).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(0, duckdb::types::Type::Text, Box::new(e))
    })?;
    let correlation_id = row
        .get::<_, Option<String>>(1)?
        .and_then(|s| Uuid::parse_str(&s).ok());
    let level = LogLevel::from_id(row.get::<_, i32>(4)? as i64)
        .ok_or_else(|| conversion_error(4, duckdb::types::Type::Int, "level out of range"))?;
    let timestamp = reconstruct_timestamp(row.get(5)?, row.get(6)?)
        .ok_or_else(|| conversion_error(5, duckdb::types::Type::BigInt, "invalid timestamp"))?;

    Ok(LogRecord {
        unique_id,
        correlation_id,
        message: row.get(2)?,
        source: row.get(3)?,
        level,
        timestamp,
    })
}

fn select_by_unique_id(conn: &Connection, unique_id: &str) -> Result<Option<LogRecord>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM logs l WHERE l.unique_id = ?",
        RECORD_COLUMNS
    ))?;
    let mut rows = stmt.query(params![unique_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_record(row)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE SEQUENCE IF NOT EXISTS logs_id_seq START 1;
                 CREATE TABLE IF NOT EXISTS logs (
                    id BIGINT PRIMARY KEY DEFAULT nextval('logs_id_seq'),
                    unique_id VARCHAR NOT NULL UNIQUE,
                    correlation_id VARCHAR,
                    timestamp BIGINT NOT NULL,
                    offset_minutes INTEGER NOT NULL,
                    level INTEGER NOT NULL,
                    message VARCHAR NOT NULL,
                    source VARCHAR NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
                 CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
                 CREATE TABLE IF NOT EXISTS logs_terms (
                    term VARCHAR NOT NULL,
                    log_id BIGINT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_logs_terms_term ON logs_terms(term);
                 CREATE INDEX IF NOT EXISTS idx_logs_terms_log ON logs_terms(log_id);",
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_one(&self, record: &LogRecord) -> Result<bool, StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = insert_record(&tx, &record)?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn insert_batch(&self, records: &[LogRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut skipped = 0usize;
            for record in &records {
                if !insert_record(&tx, record)? {
                    skipped += 1;
                }
            }
            tx.commit()?;

            if skipped > 0 {
                tracing::debug!(skipped, total = records.len(), "Skipped already stored records");
            }
            Ok(())
        })
        .await
    }

    async fn get_by_unique_id(&self, unique_id: Uuid) -> Result<Option<LogRecord>, StorageError> {
        let unique_id = unique_id.to_string();
        self.with_conn(move |conn| select_by_unique_id(conn, &unique_id)).await
    }

    async fn search(&self, search: &SearchQuery) -> Result<SearchResults, StorageError> {
        if let Some(unique_id) = search.unique_id {
            let records: Vec<LogRecord> = self.get_by_unique_id(unique_id).await?.into_iter().collect();
            let pagination = PaginationInfo::new(1, 1, records.len() as u64);
            return Ok(SearchResults { records, pagination });
        }

        let resolved = query::resolve(search, Utc::now());
        let sql = query::build_sql(search, &resolved);
        let term = (!resolved.terms.is_empty())
            .then(|| search.search_text.clone())
            .flatten();

        let (total, mut records) = self
            .with_conn(move |conn| {
                let total: i64 = conn.query_row(&sql.count_sql, params_from_iter(sql.params), |row| row.get(0))?;

                let mut stmt = conn.prepare(&sql.select_sql)?;
                let rows = stmt.query_map(params_from_iter(sql.select_params), row_to_record)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok((total.max(0) as u64, records))
            })
            .await?;

        for record in &mut records {
            record.message = query::snippet(&record.message, term.as_deref());
        }

        Ok(SearchResults {
            records,
            pagination: PaginationInfo::new(resolved.page, resolved.page_size, total),
        })
    }

    async fn update_message(&self, unique_id: Uuid, message: &str) -> Result<bool, StorageError> {
        let unique_id = unique_id.to_string();
        let message = message.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(log_id) = find_id(&tx, &unique_id)? else {
                return Ok(false);
            };

            tx.execute("UPDATE logs SET message = ? WHERE id = ?", params![message, log_id])?;
            tx.execute("DELETE FROM logs_terms WHERE log_id = ?", params![log_id])?;
            index_message(&tx, log_id, &message)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_by_unique_id(&self, unique_id: Uuid) -> Result<bool, StorageError> {
        let unique_id = unique_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(log_id) = find_id(&tx, &unique_id)? else {
                return Ok(false);
            };

            tx.execute("DELETE FROM logs_terms WHERE log_id = ?", params![log_id])?;
            tx.execute("DELETE FROM logs WHERE id = ?", params![log_id])?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let cutoff = cutoff.timestamp();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM logs_terms WHERE log_id IN (SELECT id FROM logs WHERE timestamp < ?)",
                params![cutoff],
            )?;
            let deleted = tx.execute("DELETE FROM logs WHERE timestamp < ?", params![cutoff])?;
            tx.commit()?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn statistics(&self) -> Result<LogStatistics, StorageError> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;

            let mut stmt = conn.prepare("SELECT level, COUNT(*) FROM logs GROUP BY level ORDER BY level")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?)))?;
            let mut by_level = Vec::new();
            for row in rows {
                let (level, count) = row?;
                let level = LogLevel::from_id(level as i64)
                    .ok_or_else(|| StorageError::CorruptRow(format!("level {} out of range", level)))?;
                by_level.push(LevelCount {
                    level,
                    count: count as u64,
                });
            }

            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*) AS n FROM logs GROUP BY source ORDER BY n DESC, source LIMIT 10",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SourceCount {
                    source: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?;
            let mut top_sources = Vec::new();
            for row in rows {
                top_sources.push(row?);
            }

            Ok(LogStatistics {
                total: total as u64,
                by_level,
                top_sources,
            })
        })
        .await
    }
}
