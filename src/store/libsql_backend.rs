//! libSQL backend for the correlation store.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared and every operation holds `conn_lock` while it uses it, so a
//! reader never observes the open transaction of a concurrent create and
//! multi-statement writes never interleave.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{CorrelationStore, PageCursor, TaskFilter, initial_entry};
use crate::task::model::{HistoryEntry, TaskRecord, TaskStatus};

const TASK_COLUMNS: &str = "task_id, thread_id, format, intent, confidence, source, status, \
     handler, extracted_fields, error, created_at, updated_at, version";

/// libSQL-backed correlation store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    conn_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        info!(path = %path.display(), "Correlation store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Backend(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            conn_lock: Mutex::new(()),
        })
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn load_history(&self, task_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, timestamp, status, actor, note FROM task_history
                 WHERE task_id = ?1 ORDER BY seq ASC",
                params![task_id],
            )
            .await
            .map_err(backend("load history"))?;

        let mut history = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend("read history row"))? {
            history.push(row_to_entry(&row)?);
        }
        Ok(history)
    }

    /// Attach history to each record of a page.
    async fn with_history(&self, rows: &mut libsql::Rows) -> Result<Vec<TaskRecord>, StoreError> {
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend("read task row"))? {
            records.push(row_to_record(&row)?);
        }
        for record in &mut records {
            record.history = self.load_history(&record.task_id).await?;
        }
        Ok(records)
    }

    async fn current_version(&self, task_id: &str) -> Result<Option<u64>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT version FROM tasks WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(backend("read version"))?;
        match rows.next().await.map_err(backend("read version row"))? {
            Some(row) => {
                let version: i64 = row.get(0).map_err(backend("parse version"))?;
                Ok(Some(version as u64))
            }
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn backend(op: &'static str) -> impl Fn(libsql::Error) -> StoreError {
    move |e| StoreError::Backend(format!("{op}: {e}"))
}

/// Canonical timestamp encoding. Fixed width, so text order is time order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_json<T: serde::Serialize>(value: Option<&T>) -> Result<libsql::Value, StoreError> {
    Ok(opt_text(value.map(serde_json::to_string).transpose()?))
}

fn parse_label<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn row_to_record(row: &libsql::Row) -> Result<TaskRecord, StoreError> {
    let text = |idx: i32| row.get::<String>(idx).map_err(backend("read column"));
    let opt = |idx: i32| row.get::<String>(idx).ok();

    let extracted_fields = opt(8).map(|s| serde_json::from_str(&s)).transpose()?;
    let error = opt(9).map(|s| serde_json::from_str(&s)).transpose()?;
    let version: i64 = row.get(12).map_err(backend("read version"))?;

    Ok(TaskRecord {
        task_id: text(0)?,
        thread_id: text(1)?,
        format: parse_label(&text(2)?)?,
        intent: parse_label(&text(3)?)?,
        confidence: row.get::<f64>(4).ok().map(|c| c as f32),
        source: opt(5),
        status: parse_label(&text(6)?)?,
        handler: opt(7),
        extracted_fields,
        error,
        created_at: parse_datetime(&text(10)?)?,
        updated_at: parse_datetime(&text(11)?)?,
        history: Vec::new(),
        version: version as u64,
    })
}

fn row_to_entry(row: &libsql::Row) -> Result<HistoryEntry, StoreError> {
    let seq: i64 = row.get(0).map_err(backend("read seq"))?;
    let timestamp: String = row.get(1).map_err(backend("read timestamp"))?;
    let status: String = row.get(2).map_err(backend("read status"))?;
    Ok(HistoryEntry {
        seq: seq as u64,
        timestamp: parse_datetime(&timestamp)?,
        status: parse_label(&status)?,
        actor: row.get(3).map_err(backend("read actor"))?,
        note: row.get(4).map_err(backend("read note"))?,
    })
}

fn cursor_params(cursor: Option<&PageCursor>) -> (libsql::Value, libsql::Value) {
    match cursor {
        Some(c) => (
            libsql::Value::Text(fmt_datetime(&c.created_at)),
            libsql::Value::Text(c.task_id.clone()),
        ),
        None => (libsql::Value::Null, libsql::Value::Null),
    }
}

// ── CorrelationStore impl ───────────────────────────────────────────

#[async_trait]
impl CorrelationStore for LibSqlStore {
    fn backend_name(&self) -> &'static str {
        "libsql"
    }

    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let first = initial_entry(record);
        let _guard = self.conn_lock.lock().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(backend("begin create"))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO tasks (task_id, thread_id, format, intent, confidence, source,
                    status, status_rank, handler, extracted_fields, error, created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1)",
                params![
                    record.task_id.as_str(),
                    record.thread_id.as_str(),
                    record.format.to_string(),
                    record.intent.to_string(),
                    record
                        .confidence
                        .map(|c| libsql::Value::Real(c as f64))
                        .unwrap_or(libsql::Value::Null),
                    opt_text(record.source.clone()),
                    record.status.to_string(),
                    record.status.rank() as i64,
                    opt_text(record.handler.clone()),
                    opt_json(record.extracted_fields.as_ref())?,
                    opt_json(record.error.as_ref())?,
                    fmt_datetime(&record.created_at),
                    fmt_datetime(&record.updated_at),
                ],
            )
            .await
            .map_err(backend("insert task"))?;

        if inserted == 0 {
            tx.rollback().await.map_err(backend("rollback create"))?;
            return Err(StoreError::AlreadyExists {
                task_id: record.task_id.clone(),
            });
        }

        tx.execute(
            "INSERT INTO task_history (task_id, seq, timestamp, status, actor, note)
             VALUES (?1, 1, ?2, ?3, ?4, ?5)",
            params![
                record.task_id.as_str(),
                fmt_datetime(&first.timestamp),
                first.status.to_string(),
                first.actor.as_str(),
                first.note.as_str(),
            ],
        )
        .await
        .map_err(backend("insert first history entry"))?;

        tx.commit().await.map_err(backend("commit create"))?;
        debug!(task_id = %record.task_id, "Task record created");
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
            )
            .await
            .map_err(backend("get task"))?;

        let row = rows
            .next()
            .await
            .map_err(backend("read task row"))?
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })?;
        let mut record = row_to_record(&row)?;
        record.history = self.load_history(task_id).await?;
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        task_id: &str,
        expected_version: u64,
        record: &TaskRecord,
    ) -> Result<u64, StoreError> {
        let _guard = self.conn_lock.lock().await;

        let updated = self
            .conn
            .execute(
                "UPDATE tasks SET thread_id = ?3, format = ?4, intent = ?5, confidence = ?6,
                    source = ?7, status = ?8, status_rank = ?9, handler = ?10,
                    extracted_fields = ?11, error = ?12, updated_at = ?13, version = version + 1
                 WHERE task_id = ?1 AND version = ?2",
                params![
                    task_id,
                    expected_version as i64,
                    record.thread_id.as_str(),
                    record.format.to_string(),
                    record.intent.to_string(),
                    record
                        .confidence
                        .map(|c| libsql::Value::Real(c as f64))
                        .unwrap_or(libsql::Value::Null),
                    opt_text(record.source.clone()),
                    record.status.to_string(),
                    record.status.rank() as i64,
                    opt_text(record.handler.clone()),
                    opt_json(record.extracted_fields.as_ref())?,
                    opt_json(record.error.as_ref())?,
                    fmt_datetime(&record.updated_at),
                ],
            )
            .await
            .map_err(backend("compare and swap"))?;

        if updated == 1 {
            return Ok(expected_version + 1);
        }

        match self.current_version(task_id).await? {
            Some(actual) => Err(StoreError::VersionConflict {
                task_id: task_id.to_string(),
                expected: expected_version,
                actual,
            }),
            None => Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn append_history(&self, task_id: &str, entry: &HistoryEntry) -> Result<u64, StoreError> {
        let _guard = self.conn_lock.lock().await;

        if self.current_version(task_id).await?.is_none() {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        }

        let mut rows = self
            .conn
            .query(
                "INSERT INTO task_history (task_id, seq, timestamp, status, actor, note)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5
                 FROM task_history WHERE task_id = ?1
                 RETURNING seq",
                params![
                    task_id,
                    fmt_datetime(&entry.timestamp),
                    entry.status.to_string(),
                    entry.actor.as_str(),
                    entry.note.as_str(),
                ],
            )
            .await
            .map_err(backend("append history"))?;

        let row = rows
            .next()
            .await
            .map_err(backend("read appended seq"))?
            .ok_or_else(|| StoreError::Backend("append history returned no seq".into()))?;
        let seq: i64 = row.get(0).map_err(backend("parse appended seq"))?;
        Ok(seq as u64)
    }

    async fn thread_page(
        &self,
        thread_id: &str,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let (after_ts, after_id) = cursor_params(cursor);
        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE thread_id = ?1
                       AND (?2 IS NULL OR created_at > ?2 OR (created_at = ?2 AND task_id > ?3))
                     ORDER BY created_at ASC, task_id ASC
                     LIMIT ?4"
                ),
                params![thread_id, after_ts, after_id, limit as i64],
            )
            .await
            .map_err(backend("thread page"))?;
        self.with_history(&mut rows).await
    }

    async fn query_page(
        &self,
        filter: &TaskFilter,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let (after_ts, after_id) = cursor_params(cursor);
        let rank = |s: Option<TaskStatus>| {
            s.map(|s| libsql::Value::Integer(s.rank() as i64))
                .unwrap_or(libsql::Value::Null)
        };
        let exact_status = match (filter.status_min, filter.status_max) {
            (Some(min), Some(max)) if min == max => libsql::Value::Text(min.to_string()),
            _ => libsql::Value::Null,
        };

        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR format = ?1)
                       AND (?2 IS NULL OR intent = ?2)
                       AND (?3 IS NULL OR status_rank >= ?3)
                       AND (?4 IS NULL OR status_rank <= ?4)
                       AND (?5 IS NULL OR status = ?5)
                       AND (?6 IS NULL OR created_at >= ?6)
                       AND (?7 IS NULL OR created_at < ?7)
                       AND (?8 IS NULL OR created_at > ?8 OR (created_at = ?8 AND task_id > ?9))
                     ORDER BY created_at ASC, task_id ASC
                     LIMIT ?10"
                ),
                params![
                    opt_text(filter.format.map(|f| f.to_string())),
                    opt_text(filter.intent.map(|i| i.to_string())),
                    rank(filter.status_min),
                    rank(filter.status_max),
                    exact_status,
                    opt_text(filter.created_from.as_ref().map(fmt_datetime)),
                    opt_text(filter.created_until.as_ref().map(fmt_datetime)),
                    after_ts,
                    after_id,
                    limit as i64,
                ],
            )
            .await
            .map_err(backend("query page"))?;
        self.with_history(&mut rows).await
    }
}
