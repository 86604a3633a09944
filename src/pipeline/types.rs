//! Shared types for the classification and routing pipeline.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::task::model::{Format, Intent};

// ── Inbound input ───────────────────────────────────────────────────

/// Caller-declared metadata that travels with an input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredMetadata {
    /// Format the caller says the input has. Overrides the oracle.
    #[serde(default)]
    pub format_hint: Option<Format>,
    /// Origin of the input, e.g. an uploaded file name.
    #[serde(default)]
    pub source: Option<String>,
    /// MIME type, when known.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Sender address for correspondence without headers.
    #[serde(default)]
    pub sender: Option<String>,
}

/// An unprocessed input as submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInput {
    pub content: Vec<u8>,
    pub metadata: DeclaredMetadata,
}

impl RawInput {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            metadata: DeclaredMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DeclaredMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Content as text. Invalid UTF-8 is replaced, never rejected.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    pub fn is_blank(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// Options accepted by `Router::submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Caller-chosen task id; a UUID v4 is generated when absent.
    pub task_id: Option<String>,
    /// Correlation key; defaults to the task id.
    pub thread_id: Option<String>,
}

// ── Classification ──────────────────────────────────────────────────

/// Raw labels as an oracle produced them, before vocabulary checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub format: String,
    pub intent: String,
    #[serde(default)]
    pub confidence: f32,
}

/// Outcome of classification. Always within the vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub format: Format,
    pub intent: Intent,
    pub confidence: f32,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            format: Format::Unknown,
            intent: Intent::Unknown,
            confidence: 0.0,
        }
    }

    /// History note for the Processing entry.
    pub fn note(&self) -> String {
        format!("{}/{} ({:.2})", self.format, self.intent, self.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossy_text_never_fails() {
        let raw = RawInput::new(vec![b'h', b'i', 0xFF, b'!']);
        assert_eq!(raw.text(), "hi\u{FFFD}!");
    }

    #[test]
    fn blank_detection() {
        assert!(RawInput::new("  \n\t").is_blank());
        assert!(!RawInput::new("x").is_blank());
    }

    #[test]
    fn classification_note_format() {
        let c = Classification {
            format: Format::Correspondence,
            intent: Intent::Rfq,
            confidence: 0.8,
        };
        assert_eq!(c.note(), "Correspondence/RFQ (0.80)");
    }

    #[test]
    fn metadata_deserializes_with_missing_fields() {
        let meta: DeclaredMetadata = serde_json::from_str(r#"{"source":"a.json"}"#).unwrap();
        assert_eq!(meta.source.as_deref(), Some("a.json"));
        assert!(meta.format_hint.is_none());
    }
}
