use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use super::AppState;
use crate::error::{RouterError, StoreError};
use crate::pipeline::{DeclaredMetadata, RawInput, SubmitOptions};
use crate::store::TaskFilter;
use crate::task::model::{Format, Intent, TaskStatus};

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Store failures on read paths are 503; a missing task is 404.
fn store_failure(e: StoreError) -> Response {
    match e {
        StoreError::NotFound { task_id } => {
            error_body(StatusCode::NOT_FOUND, format!("task {task_id} not found"))
        }
        other => {
            error!(error = %other, "Store read failed");
            error_body(StatusCode::SERVICE_UNAVAILABLE, other.to_string())
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────

pub(super) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "doc-router",
        "store": state.status.backend_name(),
    }))
}

// ── Submit ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct ProcessRequest {
    content: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    format_hint: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    sender: Option<String>,
}

pub(super) async fn process(
    State(state): State<AppState>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected /process body");
            return error_body(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let format_hint = match body.format_hint.as_deref() {
        None => None,
        Some(label) => match Format::from_label(label) {
            Some(format) => Some(format),
            None => {
                return error_body(StatusCode::BAD_REQUEST, format!("unknown format_hint: '{label}'"));
            }
        },
    };

    let input = RawInput::new(body.content).with_metadata(DeclaredMetadata {
        format_hint,
        source: body.source,
        content_type: body.content_type,
        sender: body.sender,
    });
    let options = SubmitOptions {
        task_id: body.task_id,
        thread_id: body.thread_id,
    };

    match state.router.submit(input, options).await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))).into_response(),
        Err(RouterError::InvalidSubmission(message)) => error_body(StatusCode::BAD_REQUEST, message),
        Err(RouterError::Store(StoreError::AlreadyExists { task_id })) => {
            error_body(StatusCode::CONFLICT, format!("task {task_id} already exists"))
        }
        Err(e) => {
            warn!(error = %e, "Submit failed");
            error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ── Read ────────────────────────────────────────────────────────────

pub(super) async fn get_status(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.status.get_status(&task_id).await {
        Ok(summary) => (StatusCode::OK, Json(json!(summary))).into_response(),
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    thread_id: Option<String>,
}

pub(super) async fn get_history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> Response {
    let Some(thread_id) = query.thread_id.filter(|t| !t.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "thread_id is required");
    };
    match state.status.get_history(&thread_id).await {
        Ok(tasks) => (StatusCode::OK, Json(json!(tasks))).into_response(),
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TasksQuery {
    format: Option<String>,
    intent: Option<String>,
    status: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

impl TasksQuery {
    fn into_filter(self) -> Result<TaskFilter, String> {
        let mut filter = TaskFilter {
            format: self.format.as_deref().map(str::parse::<Format>).transpose()?,
            intent: self.intent.as_deref().map(str::parse::<Intent>).transpose()?,
            created_from: self.since,
            created_until: self.until,
            ..TaskFilter::default()
        };
        if let Some(status) = self.status.as_deref() {
            filter = filter.with_status(status.parse::<TaskStatus>()?);
        }
        Ok(filter)
    }
}

pub(super) async fn list_tasks(State(state): State<AppState>, Query(query): Query<TasksQuery>) -> Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(message) => return error_body(StatusCode::BAD_REQUEST, message),
    };
    match state.status.query(&filter).await {
        Ok(tasks) => (StatusCode::OK, Json(json!(tasks))).into_response(),
        Err(e) => store_failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(format: Option<&str>, status: Option<&str>) -> TasksQuery {
        TasksQuery {
            format: format.map(String::from),
            intent: None,
            status: status.map(String::from),
            since: None,
            until: None,
        }
    }

    #[test]
    fn tasks_query_builds_filter() {
        let filter = query(Some("json"), Some("Done")).into_filter().unwrap();
        assert_eq!(filter.format, Some(Format::StructuredData));
        assert_eq!(filter.status_min, Some(TaskStatus::Done));
        assert_eq!(filter.status_max, Some(TaskStatus::Done));
    }

    #[test]
    fn tasks_query_rejects_unknown_labels() {
        assert!(query(Some("spreadsheet"), None).into_filter().is_err());
        assert!(query(None, Some("Sleeping")).into_filter().is_err());
    }

    #[test]
    fn store_failures_map_to_status_codes() {
        let not_found = store_failure(StoreError::NotFound { task_id: "x".into() });
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let backend = store_failure(StoreError::Backend("down".into()));
        assert_eq!(backend.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
