//! Error types for doc-router.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::model::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Store backend {0} is not compiled into this build")]
    BackendUnavailable(String),
}

/// Correlation store errors.
///
/// `VersionConflict` is expected under concurrency and is retried by the
/// router; the others surface to callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task {task_id} already exists")]
    AlreadyExists { task_id: String },

    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Version conflict on task {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        task_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Store operation {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors from an inference oracle. Never fatal to a task: the classifier
/// degrades them to `Unknown` labels.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle {oracle} unavailable: {reason}")]
    Unavailable { oracle: String, reason: String },

    #[error("Invalid response from {oracle}: {reason}")]
    InvalidResponse { oracle: String, reason: String },

    #[error("Oracle {oracle} timed out after {after:?}")]
    Timeout { oracle: String, after: Duration },
}

/// Handler-level extraction failures. Each handler classifies its own
/// failures into one of these kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("Schema invalid: {reason}")]
    SchemaInvalid { reason: String },

    #[error("Missing required field: {field}")]
    MissingRequiredField { field: String },

    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String },
}

impl ExtractionError {
    /// The persisted error kind for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaInvalid { .. } => ErrorKind::SchemaInvalid,
            Self::MissingRequiredField { .. } => ErrorKind::MissingRequiredField,
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
        }
    }
}

/// Router errors surfaced to callers of `submit`/`run`.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task {task_id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id} still conflicting after {attempts} CAS attempts")]
    Contention { task_id: String, attempts: u32 },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Worker queue closed")]
    QueueClosed,
}

/// Error kinds persisted on a failed `TaskRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoCapableHandler,
    SchemaInvalid,
    MissingRequiredField,
    MalformedInput,
    Timeout,
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoCapableHandler => "NoCapableHandler",
            Self::SchemaInvalid => "SchemaInvalid",
            Self::MissingRequiredField => "MissingRequiredField",
            Self::MalformedInput => "MalformedInput",
            Self::Timeout => "Timeout",
            Self::InternalError => "InternalError",
        };
        write!(f, "{s}")
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
