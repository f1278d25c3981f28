use super::traits::{Broker, BrokerError, EntryId, EntryStatus, RawMessage, StartPosition};
use crate::storage::duckdb::{ensure_parent_dir, open_connection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const ENTRY_COLUMNS: &str = "e.id, e.payload, e.status, e.attempts, e.error_info, e.appended_at";

/// Durable stream with consumer groups, kept in its own DuckDB database.
pub struct DuckDbBroker {
    conn: Arc<Mutex<Connection>>,
    appended: Arc<Notify>,
}

impl DuckDbBroker {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        ensure_parent_dir(path).map_err(|e| {
            BrokerError::Database(format!("failed to create directory for '{}': {}", path.display(), e))
        })?;

        let conn = open_connection(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self, BrokerError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            appended: Arc::new(Notify::new()),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BrokerError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| BrokerError::LockPoisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BrokerError::Database(format!("Task join error: {}", e)))?
    }

    async fn try_read(&self, group: &str, consumer: &str, batch_size: usize) -> Result<Vec<RawMessage>, BrokerError> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            require_group(&tx, &group)?;

            let entries = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM stream_entries e, consumer_groups g
                     WHERE g.name = ? AND e.id > g.last_delivered
                       AND (g.statuses = '' OR list_contains(string_split(g.statuses, ','), e.status))
                     ORDER BY e.id
                     LIMIT ?",
                    ENTRY_COLUMNS
                ))?;
                let rows = stmt.query_map(params![group, batch_size as i64], row_to_message)?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                entries
            };

            if let Some(last) = entries.last() {
                let now = now_millis();
                let mut insert = tx.prepare(
                    "INSERT INTO pending_entries (group_name, entry_id, consumer, delivered_at, delivery_count)
                     VALUES (?, ?, ?, ?, 1)",
                )?;
                for entry in &entries {
                    insert.execute(params![group, entry.id, consumer, now])?;
                }
                tx.execute(
                    "UPDATE consumer_groups SET last_delivered = ? WHERE name = ?",
                    params![last.id, group],
                )?;
            }

            tx.commit()?;
            Ok(entries)
        })
        .await
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn require_group(conn: &Connection, group: &str) -> Result<(), BrokerError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM consumer_groups WHERE name = ?",
        params![group],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(BrokerError::UnknownGroup(group.to_string()));
    }
    Ok(())
}

fn row_to_message(row: &duckdb::Row<'_>) -> duckdb::Result<RawMessage> {
    let status: String = row.get(2)?;
    let status = EntryStatus::parse(&status).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            2,
            duckdb::types::Type::Text,
            Box::new(BrokerError::CorruptEntry(format!("unknown status '{}'", status))),
        )
    })?;
    let appended_at = DateTime::from_timestamp_millis(row.get(5)?).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            5,
            duckdb::types::Type::BigInt,
            Box::new(BrokerError::CorruptEntry("invalid append time".to_string())),
        )
    })?;

    Ok(RawMessage {
        id: row.get(0)?,
        payload: row.get(1)?,
        status,
        attempts: row.get(3)?,
        error_info: row.get(4)?,
        appended_at,
    })
}

fn collect_messages(
    conn: &Connection,
    sql: &str,
    values: Vec<duckdb::types::Value>,
) -> Result<Vec<RawMessage>, BrokerError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values), row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

#[async_trait]
impl Broker for DuckDbBroker {
    async fn init_schema(&self) -> Result<(), BrokerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE SEQUENCE IF NOT EXISTS stream_entry_seq START 1;
                 CREATE TABLE IF NOT EXISTS stream_entries (
                    id UBIGINT PRIMARY KEY,
                    payload VARCHAR NOT NULL,
                    status VARCHAR NOT NULL,
                    attempts UINTEGER NOT NULL,
                    error_info VARCHAR,
                    appended_at BIGINT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS consumer_groups (
                    name VARCHAR PRIMARY KEY,
                    last_delivered UBIGINT NOT NULL,
                    statuses VARCHAR NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS pending_entries (
                    group_name VARCHAR NOT NULL,
                    entry_id UBIGINT NOT NULL,
                    consumer VARCHAR NOT NULL,
                    delivered_at BIGINT NOT NULL,
                    delivery_count UINTEGER NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await
    }

    async fn append(
        &self,
        payload: &str,
        status: EntryStatus,
        attempts: u32,
        error_info: Option<&str>,
    ) -> Result<EntryId, BrokerError> {
        let payload = payload.to_string();
        let error_info = error_info.map(str::to_string);
        let id = self
            .with_conn(move |conn| {
                let id: EntryId = conn.query_row(
                    "INSERT INTO stream_entries (id, payload, status, attempts, error_info, appended_at)
                     VALUES (nextval('stream_entry_seq'), ?, ?, ?, ?, ?)
                     RETURNING id",
                    params![payload, status.as_str(), attempts, error_info, now_millis()],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await?;

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        group: &str,
        start: StartPosition,
        statuses: &[EntryStatus],
    ) -> Result<bool, BrokerError> {
        let group = group.to_string();
        let statuses = statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM consumer_groups WHERE name = ?",
                params![group],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Ok(false);
            }

            let last_delivered: EntryId = match start {
                StartPosition::Beginning => 0,
                StartPosition::End => tx.query_row(
                    "SELECT CAST(COALESCE(MAX(id), 0) AS UBIGINT) FROM stream_entries",
                    [],
                    |row| row.get(0),
                )?,
            };

            tx.execute(
                "INSERT INTO consumer_groups (name, last_delivered, statuses) VALUES (?, ?, ?)",
                params![group, last_delivered, statuses],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn read(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read(group, consumer, batch_size).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(entries);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let group = group.to_string();
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM pending_entries WHERE group_name = ? AND entry_id IN ({})",
                placeholders(ids.len())
            );
            let mut values: Vec<duckdb::types::Value> = vec![duckdb::types::Value::Text(group)];
            values.extend(ids.into_iter().map(duckdb::types::Value::UBigInt));
            let removed = conn.execute(&sql, params_from_iter(values))?;
            Ok(removed as u64)
        })
        .await
    }

    async fn pending(&self, group: &str) -> Result<u64, BrokerError> {
        let group = group.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_entries WHERE group_name = ?",
                params![group],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn pending_for(&self, group: &str, consumer: &str) -> Result<Vec<RawMessage>, BrokerError> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        self.with_conn(move |conn| {
            collect_messages(
                conn,
                &format!(
                    "SELECT {} FROM stream_entries e
                     JOIN pending_entries p ON p.entry_id = e.id
                     WHERE p.group_name = ? AND p.consumer = ?
                     ORDER BY e.id",
                    ENTRY_COLUMNS
                ),
                vec![group.into(), consumer.into()],
            )
        })
        .await
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        let min_idle_ms = i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let now = now_millis();
            let idle_before = now.saturating_sub(min_idle_ms);

            let tx = conn.transaction()?;
            let claimed = collect_messages(
                &tx,
                &format!(
                    "SELECT {} FROM stream_entries e
                     JOIN pending_entries p ON p.entry_id = e.id
                     WHERE p.group_name = ? AND p.delivered_at <= ?
                     ORDER BY e.id",
                    ENTRY_COLUMNS
                ),
                vec![group.clone().into(), idle_before.into()],
            )?;

            if !claimed.is_empty() {
                let mut update = tx.prepare(
                    "UPDATE pending_entries
                     SET consumer = ?, delivered_at = ?, delivery_count = delivery_count + 1
                     WHERE group_name = ? AND entry_id = ?",
                )?;
                for entry in &claimed {
                    update.execute(params![consumer, now, group, entry.id])?;
                }
            }

            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn trim(&self, max_length: u64) -> Result<u64, BrokerError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = if max_length == 0 {
                tx.execute("DELETE FROM stream_entries", [])?
            } else {
                tx.execute(
                    "DELETE FROM stream_entries WHERE id < (
                        SELECT id FROM stream_entries ORDER BY id DESC LIMIT 1 OFFSET ?
                     )",
                    params![(max_length - 1) as i64],
                )?
            };

            if removed > 0 {
                tx.execute(
                    "DELETE FROM pending_entries WHERE entry_id NOT IN (SELECT id FROM stream_entries)",
                    [],
                )?;
            }
            tx.commit()?;
            Ok(removed as u64)
        })
        .await
    }

    async fn delete(&self, ids: &[EntryId]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let list = placeholders(ids.len());
            let values: Vec<duckdb::types::Value> =
                ids.into_iter().map(duckdb::types::Value::UBigInt).collect();

            let tx = conn.transaction()?;
            tx.execute(
                &format!("DELETE FROM pending_entries WHERE entry_id IN ({})", list),
                params_from_iter(values.clone()),
            )?;
            let removed = tx.execute(
                &format!("DELETE FROM stream_entries WHERE id IN ({})", list),
                params_from_iter(values),
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
        .await
    }

    async fn len(&self) -> Result<u64, BrokerError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM stream_entries", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}
