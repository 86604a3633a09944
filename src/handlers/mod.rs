//! Field-extraction handlers.
//!
//! A handler receives the raw input plus the classified format and intent
//! and returns normalized fields, or an `ExtractionError` naming what went
//! wrong. Handlers are selected by capability through the registry.

pub mod correspondence;
pub mod document;
pub mod structured;

use async_trait::async_trait;

pub use correspondence::CorrespondenceHandler;
pub use document::DocumentHandler;
pub use structured::StructuredDataHandler;

use crate::error::ExtractionError;
use crate::pipeline::types::RawInput;
use crate::task::model::{ExtractedFields, Format, Intent};

#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable handler name, recorded on the task and in history.
    fn name(&self) -> &str;

    async fn process(
        &self,
        input: &RawInput,
        format: Format,
        intent: Intent,
    ) -> Result<ExtractedFields, ExtractionError>;
}

/// One-line description of extracted fields for the history log.
pub fn summarize(fields: &ExtractedFields) -> String {
    let mut keys: Vec<&str> = fields.keys().map(String::as_str).collect();
    keys.sort_unstable();
    format!("extracted {} fields: {}", keys.len(), keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_lists_sorted_keys() {
        let mut fields = ExtractedFields::new();
        fields.insert("subject".into(), json!("x"));
        fields.insert("body".into(), json!("y"));
        assert_eq!(summarize(&fields), "extracted 2 fields: body, subject");
    }
}
