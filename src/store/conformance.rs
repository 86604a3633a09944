//! Behavioural checks every `CorrelationStore` backend must pass.
//! Each backend's test module calls these with a fresh store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::TryStreamExt;

use crate::error::StoreError;
use crate::store::traits::{CorrelationStore, PAGE_SIZE, TaskFilter};
use crate::task::model::{Format, HistoryEntry, Intent, TaskRecord, TaskStatus};

fn record(task_id: &str, thread_id: Option<&str>) -> TaskRecord {
    TaskRecord::received(Some(task_id.into()), thread_id.map(String::from), None)
}

pub async fn create_then_get<S: CorrelationStore + ?Sized>(store: &S) {
    let rec = record("t-create", None);
    store.create(&rec).await.unwrap();

    let got = store.get("t-create").await.unwrap();
    assert_eq!(got.task_id, "t-create");
    assert_eq!(got.thread_id, "t-create");
    assert_eq!(got.status, TaskStatus::Received);
    assert_eq!(got.version, 1);
    assert_eq!(got.history.len(), 1);
    assert_eq!(got.history[0].seq, 1);
    assert_eq!(got.history[0].status, TaskStatus::Received);
}

pub async fn duplicate_create_rejected<S: CorrelationStore + ?Sized>(store: &S) {
    let rec = record("t-dup", None);
    store.create(&rec).await.unwrap();
    let err = store.create(&rec).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
    assert_eq!(store.get("t-dup").await.unwrap().history.len(), 1);
}

pub async fn missing_task_is_not_found<S: CorrelationStore + ?Sized>(store: &S) {
    assert!(matches!(
        store.get("nope").await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
    let rec = record("nope", None);
    assert!(matches!(
        store.compare_and_swap("nope", 1, &rec).await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
    let entry = HistoryEntry::new(TaskStatus::Received, "test", "x");
    assert!(matches!(
        store.append_history("nope", &entry).await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
}

pub async fn cas_bumps_version_and_detects_conflicts<S: CorrelationStore + ?Sized>(store: &S) {
    let mut rec = record("t-cas", None);
    store.create(&rec).await.unwrap();

    rec.transition_to(TaskStatus::Classifying).unwrap();
    assert_eq!(store.compare_and_swap("t-cas", 1, &rec).await.unwrap(), 2);

    rec.transition_to(TaskStatus::Processing).unwrap();
    rec.format = Format::StructuredData;
    rec.intent = Intent::Invoice;
    rec.confidence = Some(0.9);
    match store.compare_and_swap("t-cas", 1, &rec).await.unwrap_err() {
        StoreError::VersionConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(store.compare_and_swap("t-cas", 2, &rec).await.unwrap(), 3);

    let got = store.get("t-cas").await.unwrap();
    assert_eq!(got.version, 3);
    assert_eq!(got.status, TaskStatus::Processing);
    assert_eq!(got.format, Format::StructuredData);
    assert_eq!(got.intent, Intent::Invoice);
    assert_eq!(got.confidence, Some(0.9));
    // CAS never touches history.
    assert_eq!(got.history.len(), 1);
}

pub async fn history_seq_is_monotonic<S: CorrelationStore + ?Sized>(store: &S) {
    store.create(&record("t-hist", None)).await.unwrap();
    let a = HistoryEntry::new(TaskStatus::Processing, "classifier", "Document/Other (0.50)");
    let b = HistoryEntry::new(TaskStatus::Done, "document", "3 fields");
    assert_eq!(store.append_history("t-hist", &a).await.unwrap(), 2);
    assert_eq!(store.append_history("t-hist", &b).await.unwrap(), 3);

    let got = store.get("t-hist").await.unwrap();
    let seqs: Vec<u64> = got.history.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(got.history[1].actor, "classifier");
    assert_eq!(got.history[2].note, "3 fields");
}

pub async fn concurrent_appends_get_distinct_seqs<S: CorrelationStore + 'static>(store: Arc<S>) {
    store.create(&record("t-race", None)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let entry = HistoryEntry::new(TaskStatus::Processing, "test", format!("n{i}"));
            store.append_history("t-race", &entry).await.unwrap()
        }));
    }
    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await.unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (2..=17).collect::<Vec<u64>>());

    let got = store.get("t-race").await.unwrap();
    assert_eq!(got.history.len(), 17);
    assert!(got.history.windows(2).all(|w| w[0].seq < w[1].seq));
}

pub async fn thread_listing_in_creation_order<S: CorrelationStore + ?Sized>(store: &S) {
    let base = Utc::now();
    for (i, id) in ["t-c", "t-a", "t-b"].iter().enumerate() {
        let mut rec = record(id, Some("thread-1"));
        rec.created_at = base + Duration::milliseconds(i as i64 * 10);
        rec.updated_at = rec.created_at;
        store.create(&rec).await.unwrap();
    }
    store.create(&record("t-other", Some("thread-2"))).await.unwrap();

    let listed: Vec<TaskRecord> = store.list_by_thread("thread-1").try_collect().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["t-c", "t-a", "t-b"]);
    assert!(listed.iter().all(|r| r.history.len() == 1));

    // Restartable: a second call yields the same sequence.
    let again: Vec<TaskRecord> = store.list_by_thread("thread-1").try_collect().await.unwrap();
    assert_eq!(again.len(), 3);

    let none: Vec<TaskRecord> = store.list_by_thread("thread-404").try_collect().await.unwrap();
    assert!(none.is_empty());
}

pub async fn query_filters<S: CorrelationStore + ?Sized>(store: &S) {
    let base = Utc::now() - Duration::hours(1);
    let specs = [
        ("q-1", Format::StructuredData, Intent::Invoice, TaskStatus::Done),
        ("q-2", Format::StructuredData, Intent::Rfq, TaskStatus::Failed),
        ("q-3", Format::Correspondence, Intent::Complaint, TaskStatus::Done),
        ("q-4", Format::Unknown, Intent::Unknown, TaskStatus::Received),
    ];
    for (i, (id, format, intent, status)) in specs.iter().enumerate() {
        let mut rec = record(id, None);
        rec.created_at = base + Duration::minutes(i as i64 * 10);
        rec.updated_at = rec.created_at;
        store.create(&rec).await.unwrap();
        if *status != TaskStatus::Received {
            rec.format = *format;
            rec.intent = *intent;
            rec.status = *status;
            store.compare_and_swap(id, 1, &rec).await.unwrap();
        }
    }

    let ids = |records: Vec<TaskRecord>| -> Vec<String> {
        records.into_iter().map(|r| r.task_id).collect()
    };

    let filter = TaskFilter {
        format: Some(Format::StructuredData),
        ..Default::default()
    };
    let got: Vec<TaskRecord> = store.query(&filter).try_collect().await.unwrap();
    assert_eq!(ids(got), vec!["q-1", "q-2"]);

    let filter = TaskFilter::default().with_status(TaskStatus::Done);
    let got: Vec<TaskRecord> = store.query(&filter).try_collect().await.unwrap();
    assert_eq!(ids(got), vec!["q-1", "q-3"]);

    let filter = TaskFilter {
        status_max: Some(TaskStatus::Processing),
        ..Default::default()
    };
    let got: Vec<TaskRecord> = store.query(&filter).try_collect().await.unwrap();
    assert_eq!(ids(got), vec!["q-4"]);

    let filter = TaskFilter {
        created_from: Some(base + Duration::minutes(10)),
        created_until: Some(base + Duration::minutes(30)),
        ..Default::default()
    };
    let got: Vec<TaskRecord> = store.query(&filter).try_collect().await.unwrap();
    assert_eq!(ids(got), vec!["q-2", "q-3"]);

    let filter = TaskFilter {
        intent: Some(Intent::Complaint),
        ..Default::default()
    };
    let got: Vec<TaskRecord> = store.query(&filter).try_collect().await.unwrap();
    assert_eq!(ids(got), vec!["q-3"]);
}

pub async fn streams_cross_page_boundaries<S: CorrelationStore + ?Sized>(store: &S) {
    let base = Utc::now();
    let total = PAGE_SIZE + 5;
    for i in 0..total {
        let mut rec = record(&format!("p-{i:03}"), Some("big-thread"));
        rec.created_at = base + Duration::milliseconds(i as i64);
        rec.updated_at = rec.created_at;
        store.create(&rec).await.unwrap();
    }
    let listed: Vec<TaskRecord> = store.list_by_thread("big-thread").try_collect().await.unwrap();
    assert_eq!(listed.len(), total);
    assert!(listed.windows(2).all(|w| w[0].task_id < w[1].task_id));
}
