//! Task record model and the task lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, RouterError};

/// Fields extracted by a handler.
pub type ExtractedFields = serde_json::Map<String, serde_json::Value>;

// ── Format ──────────────────────────────────────────────────────────

/// Structural category of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Document,
    StructuredData,
    Correspondence,
    Unknown,
}

impl Format {
    pub const ALL: [Format; 4] = [
        Format::Document,
        Format::StructuredData,
        Format::Correspondence,
        Format::Unknown,
    ];

    /// Map a free-form label (oracle output or caller hint) onto the
    /// vocabulary. Returns `None` for labels outside it.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "document" | "pdf" | "text" | "txt" | "application/pdf" | "text/plain" => {
                Some(Self::Document)
            }
            "structureddata" | "structured_data" | "structured" | "json" | "application/json" => {
                Some(Self::StructuredData)
            }
            "correspondence" | "email" | "mail" | "eml" | "message/rfc822" => {
                Some(Self::Correspondence)
            }
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Document => "Document",
            Self::StructuredData => "StructuredData",
            Self::Correspondence => "Correspondence",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("unknown format: '{s}'"))
    }
}

// ── Intent ──────────────────────────────────────────────────────────

/// Business purpose of an input. Bounded vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Invoice,
    #[serde(rename = "RFQ")]
    Rfq,
    Complaint,
    Regulation,
    Other,
    Unknown,
}

impl Intent {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "invoice" => Some(Self::Invoice),
            "rfq" | "request_for_quote" | "request for quote" | "quote" => Some(Self::Rfq),
            "complaint" => Some(Self::Complaint),
            "regulation" | "regulatory" => Some(Self::Regulation),
            "other" => Some(Self::Other),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invoice => "Invoice",
            Self::Rfq => "RFQ",
            Self::Complaint => "Complaint",
            Self::Regulation => "Regulation",
            Self::Other => "Other",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("unknown intent: '{s}'"))
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Received,
    Classifying,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    /// Check if this status allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Received, Classifying) | (Classifying, Processing) | (Processing, Done) | (Processing, Failed)
        )
    }

    /// Done and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Position along the lifecycle. Done and Failed share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Classifying => 1,
            Self::Processing => 2,
            Self::Done | Self::Failed => 3,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "Received",
            Self::Classifying => "Classifying",
            Self::Processing => "Processing",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "received" => Ok(Self::Received),
            "classifying" => Ok(Self::Classifying),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown status: '{s}'")),
        }
    }
}

// ── History & errors ────────────────────────────────────────────────

/// One entry in a task's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Store-assigned sequence number (1-based, per task). Zero until appended.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub status: TaskStatus,
    /// Component that produced the entry ("router", "classifier", a handler name).
    pub actor: String,
    pub note: String,
}

impl HistoryEntry {
    pub fn new(status: TaskStatus, actor: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            status,
            actor: actor.into(),
            note: note.into(),
        }
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

// ── TaskRecord ──────────────────────────────────────────────────────

/// The persisted unit of routed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub thread_id: String,
    pub format: Format,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Caller-declared origin, e.g. an uploaded file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<ExtractedFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Materialized from the store's history log on read; ignored on write.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Store-internal CAS version. Set by the store on read.
    #[serde(default)]
    pub version: u64,
}

impl TaskRecord {
    /// A freshly ingested task. `thread_id` defaults to the task id.
    pub fn received(
        task_id: Option<String>,
        thread_id: Option<String>,
        source: Option<String>,
    ) -> Self {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let thread_id = thread_id.unwrap_or_else(|| task_id.clone());
        // Microsecond precision so every backend orders identically.
        let now = Utc::now().trunc_subsecs(6);
        Self {
            task_id,
            thread_id,
            format: Format::Unknown,
            intent: Intent::Unknown,
            confidence: None,
            source,
            status: TaskStatus::Received,
            created_at: now,
            updated_at: now,
            handler: None,
            extracted_fields: None,
            error: None,
            history: Vec::new(),
            version: 0,
        }
    }

    /// Move to `target`, bumping `updated_at`. Fails on any transition
    /// outside the lifecycle.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), RouterError> {
        if !self.status.can_transition_to(target) {
            return Err(RouterError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        let now = Utc::now();
        // Keep updated_at strictly monotonic even on coarse clocks.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy without history, as written to a backend's record slot.
    pub fn without_history(&self) -> Self {
        Self {
            history: Vec::new(),
            ..self.clone()
        }
    }
}
