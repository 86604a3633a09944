//! Generic document handler, also the registry default.
//!
//! Works on plain text (non-UTF-8 bytes are decoded lossily) and produces a
//! short summary with basic statistics and the most frequent topic words.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::error::ExtractionError;
use crate::handlers::Handler;
use crate::pipeline::types::RawInput;
use crate::task::model::{ExtractedFields, Format, Intent};

const SUMMARY_MAX_CHARS: usize = 200;
const KEY_TOPIC_COUNT: usize = 5;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "see", "who",
    "did", "get", "him", "let", "she", "too", "use", "that", "this", "with", "from", "they",
    "will", "would", "there", "their", "what", "about", "which", "when", "your", "been", "were",
    "into", "than", "then", "them", "these", "those", "some", "such", "only", "also", "each",
    "other", "more", "most", "very", "just", "over", "under", "shall", "should", "could", "must",
    "within", "upon", "please", "dear", "regards",
];

/// Handler for `Document` inputs and anything without a better match.
#[derive(Debug, Default)]
pub struct DocumentHandler;

impl DocumentHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for DocumentHandler {
    fn name(&self) -> &str {
        "document"
    }

    async fn process(
        &self,
        input: &RawInput,
        _format: Format,
        _intent: Intent,
    ) -> Result<ExtractedFields, ExtractionError> {
        let text = input.text();
        let text = text.trim();
        if text.is_empty() {
            return Err(ExtractionError::MalformedInput {
                reason: "document is empty".into(),
            });
        }

        let mut out = ExtractedFields::new();
        out.insert("summary".into(), json!(summary(text)));
        out.insert("line_count".into(), json!(text.lines().count()));
        out.insert("word_count".into(), json!(text.split_whitespace().count()));
        out.insert("key_topics".into(), json!(key_topics(text, KEY_TOPIC_COUNT)));
        if let Some(source) = &input.metadata.source {
            out.insert("source".into(), json!(source));
        }
        Ok(out)
    }
}

/// First sentence, capped at `SUMMARY_MAX_CHARS` characters.
fn summary(text: &str) -> String {
    let first_line_block = text.split("\n\n").next().unwrap_or(text);
    let sentence_end = first_line_block
        .char_indices()
        .find(|(i, c)| {
            matches!(c, '.' | '!' | '?')
                && first_line_block[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(first_line_block.len());

    let sentence = first_line_block[..sentence_end].split_whitespace().collect::<Vec<_>>().join(" ");
    if sentence.chars().count() <= SUMMARY_MAX_CHARS {
        return sentence;
    }
    let mut cut: String = sentence.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

/// Most frequent non-stopword terms, ties broken alphabetically.
fn key_topics(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3 && w.chars().any(char::is_alphabetic))
    {
        let word = word.to_lowercase();
        if STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        *counts.entry(word).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(w, _)| w).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: RawInput) -> Result<ExtractedFields, ExtractionError> {
        DocumentHandler::new()
            .process(&input, Format::Document, Intent::Other)
            .await
    }

    #[tokio::test]
    async fn extracts_statistics() {
        let text = "Quarterly report on supplier quality. Supplier audits improved.\n\
                    Quality metrics for every supplier are attached.";
        let fields = run(RawInput::new(text)).await.unwrap();
        assert_eq!(fields["summary"], "Quarterly report on supplier quality.");
        assert_eq!(fields["line_count"], 2);
        assert_eq!(fields["word_count"], 15);
        assert_eq!(fields["key_topics"][0], "supplier");
        assert_eq!(fields["key_topics"][1], "quality");
    }

    #[tokio::test]
    async fn empty_document_is_malformed() {
        let err = run(RawInput::new("   \n ")).await.unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedInput { .. }));
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let fields = run(RawInput::new(vec![b'O', b'k', 0xFE, b' ', b'd', b'o', b'c']))
            .await
            .unwrap();
        assert_eq!(fields["word_count"], 2);
    }

    #[test]
    fn long_summary_is_truncated() {
        let long = "word ".repeat(100);
        let s = summary(long.trim());
        assert_eq!(s.chars().count(), SUMMARY_MAX_CHARS);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn decimal_points_do_not_end_sentences() {
        assert_eq!(summary("Version 2.5 ships today. More later."), "Version 2.5 ships today.");
    }

    #[test]
    fn stopwords_are_ignored() {
        let topics = key_topics("the the the and and widget", 5);
        assert_eq!(topics, vec!["widget"]);
    }
}
