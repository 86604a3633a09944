//! In-process correlation store. Not persistent; intended for tests and
//! single-node deployments that accept losing state on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::{CorrelationStore, PageCursor, TaskFilter, initial_entry};
use crate::task::model::{HistoryEntry, TaskRecord};

struct Slot {
    record: TaskRecord,
    history: Vec<HistoryEntry>,
}

impl Slot {
    fn materialize(&self) -> TaskRecord {
        let mut record = self.record.clone();
        record.history = self.history.clone();
        record
    }
}

/// `RwLock<HashMap>` backed store.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<String, Slot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn page_where<P>(&self, cursor: Option<&PageCursor>, limit: usize, pred: P) -> Vec<TaskRecord>
    where
        P: Fn(&TaskRecord) -> bool,
    {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<&Slot> = tasks
            .values()
            .filter(|slot| pred(&slot.record))
            .filter(|slot| cursor.is_none_or(|c| c.precedes(&slot.record)))
            .collect();
        matched.sort_by(|a, b| {
            (a.record.created_at, &a.record.task_id).cmp(&(b.record.created_at, &b.record.task_id))
        });
        matched
            .into_iter()
            .take(limit)
            .map(Slot::materialize)
            .collect()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists {
                task_id: record.task_id.clone(),
            });
        }
        let mut first = initial_entry(record);
        first.seq = 1;
        let mut stored = record.without_history();
        stored.version = 1;
        tasks.insert(
            record.task_id.clone(),
            Slot {
                record: stored,
                history: vec![first],
            },
        );
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(Slot::materialize)
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
        let mut tasks = self.tasks.write().await;
        let slot = tasks.get_mut(task_id).ok_or_else(|| StoreError::NotFound {
            task_id: task_id.to_string(),
        })?;
        let actual = slot.record.version;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                task_id: task_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let mut stored = record.without_history();
        stored.task_id = task_id.to_string();
        stored.version = actual + 1;
        slot.record = stored;
        Ok(actual + 1)
    }

    async fn append_history(&self, task_id: &str, entry: &HistoryEntry) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks.get_mut(task_id).ok_or_else(|| StoreError::NotFound {
            task_id: task_id.to_string(),
        })?;
        let seq = slot.history.last().map(|e| e.seq).unwrap_or(0) + 1;
        let mut entry = entry.clone();
        entry.seq = seq;
        slot.history.push(entry);
        Ok(seq)
    }

    async fn thread_page(
        &self,
        thread_id: &str,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .page_where(cursor, limit, |r| r.thread_id == thread_id)
            .await)
    }

    async fn query_page(
        &self,
        filter: &TaskFilter,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.page_where(cursor, limit, |r| filter.matches(r)).await)
    }
}
