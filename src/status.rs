//! Read-only status surface over the correlation store.
//!
//! Always reads through the store; nothing is cached here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;

use crate::error::StoreError;
use crate::store::{CorrelationStore, TaskFilter};
use crate::task::model::{ExtractedFields, Format, HistoryEntry, Intent, TaskError, TaskRecord, TaskStatus};

/// Client-facing view of a task. `history` is only filled for thread
/// listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub thread_id: String,
    pub format: Format,
    pub intent: Intent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<ExtractedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl TaskSummary {
    fn from_record(record: TaskRecord, with_history: bool) -> Self {
        Self {
            task_id: record.task_id,
            thread_id: record.thread_id,
            format: record.format,
            intent: record.intent,
            confidence: record.confidence,
            source: record.source,
            status: record.status,
            handler: record.handler,
            extracted_fields: record.extracted_fields,
            error: record.error,
            created_at: record.created_at,
            updated_at: record.updated_at,
            history: if with_history { record.history } else { Vec::new() },
        }
    }
}

/// Query facade used by the HTTP layer.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn CorrelationStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn CorrelationStore>) -> Self {
        Self { store }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Current state of one task, without its history.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskSummary, StoreError> {
        let record = self.store.get(task_id).await?;
        Ok(TaskSummary::from_record(record, false))
    }

    /// Every task in a thread, oldest first, each with its history.
    pub async fn get_history(&self, thread_id: &str) -> Result<Vec<TaskSummary>, StoreError> {
        self.store
            .list_by_thread(thread_id)
            .map_ok(|record| TaskSummary::from_record(record, true))
            .try_collect()
            .await
    }

    /// Tasks matching `filter`, oldest first, without history.
    pub async fn query(&self, filter: &TaskFilter) -> Result<Vec<TaskSummary>, StoreError> {
        self.store
            .query(filter)
            .map_ok(|record| TaskSummary::from_record(record, false))
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    async fn seeded() -> StatusService {
        let store = Arc::new(InMemoryStore::new());
        for (id, thread) in [("a", "t-1"), ("b", "t-1"), ("c", "t-2")] {
            store
                .create(&TaskRecord::received(Some(id.into()), Some(thread.into()), None))
                .await
                .unwrap();
        }
        StatusService::new(store)
    }

    #[tokio::test]
    async fn status_omits_history() {
        let service = seeded().await;
        let summary = service.get_status("a").await.unwrap();
        assert_eq!(summary.status, TaskStatus::Received);
        assert!(summary.history.is_empty());

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("history").is_none());
        assert!(json.get("extracted_fields").is_none());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let service = seeded().await;
        let err = service.get_status("zzz").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn thread_history_includes_entries() {
        let service = seeded().await;
        let thread = service.get_history("t-1").await.unwrap();
        let ids: Vec<_> = thread.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(thread[0].history.len(), 1);
        assert_eq!(thread[0].history[0].status, TaskStatus::Received);

        assert!(service.get_history("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_by_status() {
        let service = seeded().await;
        let all = service.query(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let done = service
            .query(&TaskFilter::default().with_status(TaskStatus::Done))
            .await
            .unwrap();
        assert!(done.is_empty());
    }
}
