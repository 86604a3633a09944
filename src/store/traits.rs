//! Backend-agnostic correlation store trait.
//!
//! A `CorrelationStore` holds one record per task plus an append-only
//! history log. Record fields change only through `compare_and_swap`;
//! history grows only through `append_history`. Thread and filter listings
//! are exposed as lazy streams built on keyset-paged backend reads.

use std::collections::VecDeque;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::StoreError;
use crate::task::model::{Format, HistoryEntry, Intent, TaskRecord, TaskStatus};

/// Records fetched per backend round-trip when streaming.
pub const PAGE_SIZE: usize = 64;

// ── Paging ──────────────────────────────────────────────────────────

/// Position after the last record of a page. Listings are ordered by
/// `(created_at, task_id)`, so the cursor carries both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub task_id: String,
}

impl PageCursor {
    pub fn after(record: &TaskRecord) -> Self {
        Self {
            created_at: record.created_at,
            task_id: record.task_id.clone(),
        }
    }

    /// Whether `record` sorts strictly after this cursor.
    pub fn precedes(&self, record: &TaskRecord) -> bool {
        (record.created_at, record.task_id.as_str()) > (self.created_at, self.task_id.as_str())
    }
}

/// Filter for `query`. Every field is optional; an empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub format: Option<Format>,
    pub intent: Option<Intent>,
    /// Lowest lifecycle status to include (by rank).
    pub status_min: Option<TaskStatus>,
    /// Highest lifecycle status to include (by rank).
    pub status_max: Option<TaskStatus>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_until: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Filter matching exactly one status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status_min = Some(status);
        self.status_max = Some(status);
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        if self.format.is_some_and(|f| f != record.format) {
            return false;
        }
        if self.intent.is_some_and(|i| i != record.intent) {
            return false;
        }
        if let Some(min) = self.status_min {
            if record.status.rank() < min.rank() {
                return false;
            }
        }
        if let Some(max) = self.status_max {
            if record.status.rank() > max.rank() {
                return false;
            }
            // Done and Failed share a rank; an exact terminal bound must
            // still tell them apart.
            if self.status_min == Some(max) && max.is_terminal() && record.status != max {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| record.created_at < from) {
            return false;
        }
        if self.created_until.is_some_and(|until| record.created_at >= until) {
            return false;
        }
        true
    }
}

// ── Store trait ─────────────────────────────────────────────────────

/// Correlation store shared by the router and the status surface.
///
/// Implementations must be safe for concurrent use from many tasks and
/// must give read-your-writes consistency to a single caller.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Insert a new record at version 1 together with its first history
    /// entry. The first entry is `record.history[0]` when present, else a
    /// synthesized `Received` entry.
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a record with its full history ordered by `seq`.
    async fn get(&self, task_id: &str) -> Result<TaskRecord, StoreError>;

    /// Replace the record's fields if its version still equals
    /// `expected_version`. Returns the new version. The record's
    /// `history` and `version` fields are ignored.
    async fn compare_and_swap(
        &self,
        task_id: &str,
        expected_version: u64,
        record: &TaskRecord,
    ) -> Result<u64, StoreError>;

    /// Append to the task's history and return the assigned `seq`.
    async fn append_history(&self, task_id: &str, entry: &HistoryEntry)
    -> Result<u64, StoreError>;

    /// One page of a thread's records, ordered by creation, after `cursor`.
    async fn thread_page(
        &self,
        thread_id: &str,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// One page of records matching `filter`, ordered by creation, after `cursor`.
    async fn query_page(
        &self,
        filter: &TaskFilter,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Lazily stream every record in a thread. Each call starts fresh.
    fn list_by_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxStream<'a, Result<TaskRecord, StoreError>> {
        paged(move |cursor| async move {
            self.thread_page(thread_id, cursor.as_ref(), PAGE_SIZE).await
        })
    }

    /// Lazily stream every record matching `filter`.
    fn query<'a>(&'a self, filter: &'a TaskFilter) -> BoxStream<'a, Result<TaskRecord, StoreError>> {
        paged(move |cursor| async move {
            self.query_page(filter, cursor.as_ref(), PAGE_SIZE).await
        })
    }
}

/// The initial history entry for a new record.
pub fn initial_entry(record: &TaskRecord) -> HistoryEntry {
    record.history.first().cloned().unwrap_or_else(|| HistoryEntry {
        seq: 0,
        timestamp: record.created_at,
        status: TaskStatus::Received,
        actor: "router".into(),
        note: "task received".into(),
    })
}

struct PageState<F> {
    fetch: F,
    cursor: Option<PageCursor>,
    buffered: VecDeque<TaskRecord>,
    exhausted: bool,
}

/// Unfold keyset pages into a record stream. A short page ends the stream.
fn paged<'a, F, Fut>(fetch: F) -> BoxStream<'a, Result<TaskRecord, StoreError>>
where
    F: Fn(Option<PageCursor>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Vec<TaskRecord>, StoreError>> + Send + 'a,
{
    let state = PageState {
        fetch,
        cursor: None,
        buffered: VecDeque::new(),
        exhausted: false,
    };

    stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(record) = state.buffered.pop_front() {
                return Ok(Some((record, state)));
            }
            if state.exhausted {
                return Ok(None);
            }
            let page = (state.fetch)(state.cursor.clone()).await?;
            if page.len() < PAGE_SIZE {
                state.exhausted = true;
            }
            if let Some(last) = page.last() {
                state.cursor = Some(PageCursor::after(last));
            }
            state.buffered.extend(page);
        }
    })
    .boxed()
}
