//! Redis backend for the correlation store.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:task:{task_id}` | Hash | `version` and `data` (record JSON, no history) |
//! | `{prefix}:history:{task_id}` | List | History entries in seq order |
//! | `{prefix}:seq:{task_id}` | String | Per-task history sequence counter |
//! | `{prefix}:thread:{thread_id}` | Sorted Set | Thread index, scored by creation micros |
//! | `{prefix}:idx` | Sorted Set | Global index, scored by creation micros |
//!
//! Every write is a Lua script so that record, counter and indexes move
//! together in one round-trip. Because the counter is bumped and the entry
//! pushed in the same script, list position `i` always holds seq `i + 1`.

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::traits::{CorrelationStore, PageCursor, TaskFilter, initial_entry};
use crate::task::model::{HistoryEntry, TaskRecord};

/// Index entries fetched per ZRANGEBYSCORE call while paging.
const SCAN_BATCH: isize = 128;

/// Atomic create: record hash, first history entry, counter and indexes.
///
/// KEYS[1] = task hash, KEYS[2] = history list, KEYS[3] = seq counter,
/// KEYS[4] = thread index, KEYS[5] = global index.
/// ARGV[1] = record JSON, ARGV[2] = first entry JSON, ARGV[3] = task_id,
/// ARGV[4] = creation score.
/// Returns: 1 when created, 0 when the task already exists.
const LUA_CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'version', '1', 'data', ARGV[1])
redis.call('SET', KEYS[3], '1')
redis.call('RPUSH', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[4], tonumber(ARGV[4]), ARGV[3])
redis.call('ZADD', KEYS[5], tonumber(ARGV[4]), ARGV[3])
return 1
"#;

/// Conditional put (CAS).
///
/// KEYS[1] = task hash. ARGV[1] = record JSON, ARGV[2] = expected version.
/// Returns: {status, value} where status 1=success, 0=mismatch, -1=missing.
const LUA_CAS: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local expected = tonumber(ARGV[2])
local actual = tonumber(current_version)
if actual ~= expected then
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
return {1, new_version}
"#;

/// History append.
///
/// KEYS[1] = task hash, KEYS[2] = seq counter, KEYS[3] = history list.
/// ARGV[1] = entry JSON.
/// Returns: assigned seq, or -1 when the task does not exist.
const LUA_APPEND: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local seq = redis.call('INCR', KEYS[2])
redis.call('RPUSH', KEYS[3], ARGV[1])
return seq
"#;

/// Redis-backed correlation store.
///
/// Holds a `MultiplexedConnection`; every method clones it, and all clones
/// share one TCP connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect to Redis: {e}")))?;
        Ok(Self {
            conn,
            key_prefix: "doc-router".to_string(),
        })
    }

    /// Sets a custom key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.key_prefix, task_id)
    }

    fn history_key(&self, task_id: &str) -> String {
        format!("{}:history:{}", self.key_prefix, task_id)
    }

    fn seq_key(&self, task_id: &str) -> String {
        format!("{}:seq:{}", self.key_prefix, task_id)
    }

    fn thread_key(&self, thread_id: &str) -> String {
        format!("{}:thread:{}", self.key_prefix, thread_id)
    }

    fn index_key(&self) -> String {
        format!("{}:idx", self.key_prefix)
    }

    /// Load a record, or `None` when its hash is gone.
    async fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.task_key(task_id))
            .await
            .map_err(|e| map_redis_error(e, task_id))?;
        if fields.is_empty() {
            return Ok(None);
        }

        let version: u64 = fields
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                StoreError::Backend(format!("missing or invalid version field for {task_id}"))
            })?;
        let data = fields
            .get("data")
            .ok_or_else(|| StoreError::Backend(format!("missing data field for {task_id}")))?;
        let mut record: TaskRecord = serde_json::from_str(data)?;
        record.version = version;

        let raw: Vec<String> = conn
            .lrange(self.history_key(task_id), 0, -1)
            .await
            .map_err(|e| map_redis_error(e, task_id))?;
        record.history = raw
            .iter()
            .enumerate()
            .map(|(idx, json)| {
                let mut entry: HistoryEntry = serde_json::from_str(json)?;
                entry.seq = idx as u64 + 1;
                Ok(entry)
            })
            .collect::<Result<_, StoreError>>()?;
        Ok(Some(record))
    }

    /// Walk a creation-scored index from `cursor`, keeping records that
    /// satisfy `keep`, until `limit` are collected or the index runs out.
    async fn scan_index<P>(
        &self,
        index_key: &str,
        cursor: Option<&PageCursor>,
        limit: usize,
        keep: P,
    ) -> Result<Vec<TaskRecord>, StoreError>
    where
        P: Fn(&TaskRecord) -> bool + Send + Sync,
    {
        let min = cursor
            .map(|c| c.created_at.timestamp_micros().to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let mut offset: isize = 0;
        let mut out = Vec::new();

        loop {
            let ids: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
                .arg(index_key)
                .arg(&min)
                .arg("+inf")
                .arg("LIMIT")
                .arg(offset)
                .arg(SCAN_BATCH)
                .query_async(&mut self.conn.clone())
                .await
                .map_err(|e| map_redis_error(e, index_key))?;
            let fetched = ids.len() as isize;

            for task_id in &ids {
                let Some(record) = self.load(task_id).await? else {
                    continue;
                };
                if cursor.is_some_and(|c| !c.precedes(&record)) || !keep(&record) {
                    continue;
                }
                out.push(record);
                if out.len() == limit {
                    return Ok(out);
                }
            }

            if fetched < SCAN_BATCH {
                return Ok(out);
            }
            offset += fetched;
        }
    }
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StoreError {
    StoreError::Backend(format!("Redis error for {key}: {err}"))
}

#[async_trait]
impl CorrelationStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let data = serde_json::to_string(&record.without_history())?;
        let first = serde_json::to_string(&initial_entry(record))?;

        let script = Script::new(LUA_CREATE);
        let created: i64 = script
            .key(self.task_key(&record.task_id))
            .key(self.history_key(&record.task_id))
            .key(self.seq_key(&record.task_id))
            .key(self.thread_key(&record.thread_id))
            .key(self.index_key())
            .arg(data)
            .arg(first)
            .arg(&record.task_id)
            .arg(record.created_at.timestamp_micros())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &record.task_id))?;

        if created == 0 {
            return Err(StoreError::AlreadyExists {
                task_id: record.task_id.clone(),
            });
        }
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        self.load(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn compare_and_swap(
        &self,
        task_id: &str,
        expected_version: u64,
        record: &TaskRecord,
    ) -> Result<u64, StoreError> {
        let mut stored = record.without_history();
        stored.task_id = task_id.to_string();
        stored.version = 0;
        let data = serde_json::to_string(&stored)?;

        let script = Script::new(LUA_CAS);
        let result: (i64, i64) = script
            .key(self.task_key(task_id))
            .arg(data)
            .arg(expected_version)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, task_id))?;

        match result.0 {
            1 => Ok(result.1 as u64),
            0 => Err(StoreError::VersionConflict {
                task_id: task_id.to_string(),
                expected: expected_version,
                actual: result.1 as u64,
            }),
            _ => Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn append_history(&self, task_id: &str, entry: &HistoryEntry) -> Result<u64, StoreError> {
        let mut entry = entry.clone();
        entry.seq = 0;
        let json = serde_json::to_string(&entry)?;

        let script = Script::new(LUA_APPEND);
        let seq: i64 = script
            .key(self.task_key(task_id))
            .key(self.seq_key(task_id))
            .key(self.history_key(task_id))
            .arg(json)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, task_id))?;

        if seq < 0 {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(seq as u64)
    }

    async fn thread_page(
        &self,
        thread_id: &str,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.scan_index(&self.thread_key(thread_id), cursor, limit, |r| {
            r.thread_id == thread_id
        })
        .await
    }

    async fn query_page(
        &self,
        filter: &TaskFilter,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.scan_index(&self.index_key(), cursor, limit, |r| filter.matches(r))
            .await
    }
}

/// Runs against a live Redis only when `DOC_ROUTER_TEST_REDIS_URL` is set.
/// Each test uses a unique key prefix, so no cleanup is needed.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    async fn test_store() -> Option<RedisStore> {
        let url = std::env::var("DOC_ROUTER_TEST_REDIS_URL").ok()?;
        let store = RedisStore::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?");
        Some(store.with_prefix(format!("test-{}", uuid::Uuid::new_v4())))
    }

    #[tokio::test]
    async fn redis_create_then_get() {
        let Some(store) = test_store().await else { return };
        conformance::create_then_get(&store).await;
    }

    #[tokio::test]
    async fn redis_duplicate_create_rejected() {
        let Some(store) = test_store().await else { return };
        conformance::duplicate_create_rejected(&store).await;
    }

    #[tokio::test]
    async fn redis_missing_task_is_not_found() {
        let Some(store) = test_store().await else { return };
        conformance::missing_task_is_not_found(&store).await;
    }

    #[tokio::test]
    async fn redis_cas_bumps_version_and_detects_conflicts() {
        let Some(store) = test_store().await else { return };
        conformance::cas_bumps_version_and_detects_conflicts(&store).await;
    }

    #[tokio::test]
    async fn redis_history_seq_is_monotonic() {
        let Some(store) = test_store().await else { return };
        conformance::history_seq_is_monotonic(&store).await;
    }

    #[tokio::test]
    async fn redis_concurrent_appends_get_distinct_seqs() {
        let Some(store) = test_store().await else { return };
        conformance::concurrent_appends_get_distinct_seqs(std::sync::Arc::new(store)).await;
    }

    #[tokio::test]
    async fn redis_thread_listing_in_creation_order() {
        let Some(store) = test_store().await else { return };
        conformance::thread_listing_in_creation_order(&store).await;
    }

    #[tokio::test]
    async fn redis_query_filters() {
        let Some(store) = test_store().await else { return };
        conformance::query_filters(&store).await;
    }

    #[tokio::test]
    async fn redis_streams_cross_page_boundaries() {
        let Some(store) = test_store().await else { return };
        conformance::streams_cross_page_boundaries(&store).await;
    }
}
