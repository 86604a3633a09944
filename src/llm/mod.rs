//! LLM-backed inference oracle.
//!
//! Talks to the Gemini `generateContent` endpoint over reqwest and asks for a
//! single JSON object `{format, intent, confidence}`. Vocabulary checks and
//! thresholding happen in the classifier, not here.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::pipeline::classifier::InferenceOracle;
use crate::pipeline::rules::RuleOracle;
use crate::pipeline::types::{OracleVerdict, RawInput};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Characters of content sent to the model.
const PROMPT_CONTENT_CHARS: usize = 4000;

/// Pick the oracle for this configuration: Gemini when a key is present,
/// otherwise the rule-based oracle.
pub fn create_oracle(config: &OracleConfig) -> Arc<dyn InferenceOracle> {
    match &config.gemini_api_key {
        Some(key) => {
            info!("Using Gemini oracle (model: {})", config.model);
            Arc::new(GeminiOracle::new(key.clone(), &config.model))
        }
        None => {
            info!("No GEMINI_API_KEY set, using rule-based oracle");
            Arc::new(RuleOracle::default_rules())
        }
    }
}

/// Gemini classification oracle.
pub struct GeminiOracle {
    client: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    model: String,
}

impl GeminiOracle {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: GEMINI_API_BASE.to_string(),
            model: model.strip_prefix("gemini/").unwrap_or(model).to_string(),
        }
    }

    /// Point at a different endpoint, e.g. a local stub.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn unavailable(&self, reason: impl Into<String>) -> OracleError {
        OracleError::Unavailable {
            oracle: self.name().to_string(),
            reason: reason.into(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> OracleError {
        OracleError::InvalidResponse {
            oracle: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InferenceOracle for GeminiOracle {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn infer(&self, input: &RawInput) -> Result<OracleVerdict, OracleError> {
        let url = format!("{}/models/{}:generateContent", self.api_base, self.model);
        let request = json!({
            "contents": [{ "parts": [{ "text": build_classifier_prompt(input) }] }],
            "generationConfig": {
                "temperature": 0.3,
                "topK": 1,
                "topP": 1,
                "maxOutputTokens": 256,
            },
        });

        debug!(model = %self.model, "Calling Gemini");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.unavailable(format!("reading body failed: {e}")))?;
        if !status.is_success() {
            warn!(%status, "Gemini API error");
            let preview: String = body.chars().take(200).collect();
            return Err(self.unavailable(format!("HTTP {status}: {preview}")));
        }

        let text = candidate_text(&body).map_err(|e| self.invalid(e))?;
        parse_verdict(&text).map_err(|e| self.invalid(e))
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classifier_prompt(input: &RawInput) -> String {
    let mut prompt = String::with_capacity(PROMPT_CONTENT_CHARS + 512);
    prompt.push_str(
        "Analyze the following content and determine its format and intent. \
         You must respond with a valid JSON object in the following format:\n\
         {\"format\": \"PDF/JSON/EMAIL/TEXT\", \
         \"intent\": \"INVOICE/RFQ/COMPLAINT/REGULATION/OTHER\", \
         \"confidence\": 0.0 to 1.0}\n\n",
    );

    let meta = &input.metadata;
    if let Some(content_type) = &meta.content_type {
        prompt.push_str(&format!("Declared content type: {content_type}\n"));
    }
    if let Some(source) = &meta.source {
        prompt.push_str(&format!("Source: {source}\n"));
    }

    let text = input.text();
    let preview: String = text.chars().take(PROMPT_CONTENT_CHARS).collect();
    prompt.push_str(&format!("\nContent:\n{preview}\n\n"));
    prompt.push_str("Remember to respond with ONLY the JSON object, no additional text.");
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Concatenated text of the first candidate.
fn candidate_text(body: &str) -> Result<String, String> {
    let response: GeminiResponse =
        serde_json::from_str(body).map_err(|e| format!("unparseable response: {e}"))?;
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or("no candidates in response")?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err("empty content in response".into());
    }
    Ok(text)
}

fn parse_verdict(raw: &str) -> Result<OracleVerdict, String> {
    let json_str = extract_json_object(raw);
    serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Fenced code block, with or without a language tag
    if let Some(start) = trimmed.find("```") {
        let after = trimmed[start + 3..].trim_start_matches("json");
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::DeclaredMetadata;

    #[test]
    fn prompt_lists_vocabulary_and_content() {
        let input = RawInput::new("Invoice INV-1 attached").with_metadata(DeclaredMetadata {
            source: Some("upload.txt".into()),
            ..Default::default()
        });
        let prompt = build_classifier_prompt(&input);
        assert!(prompt.contains("PDF/JSON/EMAIL/TEXT"));
        assert!(prompt.contains("INVOICE/RFQ/COMPLAINT/REGULATION/OTHER"));
        assert!(prompt.contains("Source: upload.txt"));
        assert!(prompt.contains("Invoice INV-1 attached"));
    }

    #[test]
    fn prompt_truncates_content() {
        let input = RawInput::new("x".repeat(PROMPT_CONTENT_CHARS * 2));
        let prompt = build_classifier_prompt(&input);
        assert!(prompt.len() < PROMPT_CONTENT_CHARS + 1024);
    }

    #[test]
    fn extract_json_variants() {
        let direct = r#"{"format":"JSON"}"#;
        assert_eq!(extract_json_object(direct), direct);

        let fenced = "```json\n{\"format\":\"EMAIL\"}\n```";
        assert_eq!(extract_json_object(fenced), "{\"format\":\"EMAIL\"}");

        let bare_fence = "```\n{\"format\":\"TEXT\"}\n```";
        assert_eq!(extract_json_object(bare_fence), "{\"format\":\"TEXT\"}");

        let embedded = "Here you go: {\"format\":\"PDF\"} hope that helps";
        assert_eq!(extract_json_object(embedded), "{\"format\":\"PDF\"}");
    }

    #[test]
    fn parses_candidate_verdict() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{
                    "text": "```json\n{\"format\": \"EMAIL\", \"intent\": \"RFQ\", \"confidence\": 0.82}\n```"
                }]}
            }]
        })
        .to_string();
        let text = candidate_text(&body).unwrap();
        let verdict = parse_verdict(&text).unwrap();
        assert_eq!(verdict.format, "EMAIL");
        assert_eq!(verdict.intent, "RFQ");
        assert!((verdict.confidence - 0.82).abs() < 1e-6);
    }

    #[test]
    fn missing_confidence_defaults_to_zero() {
        let verdict = parse_verdict(r#"{"format":"TEXT","intent":"OTHER"}"#).unwrap();
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn empty_candidates_are_invalid() {
        assert!(candidate_text(r#"{"candidates": []}"#).is_err());
        assert!(candidate_text(r#"{"candidates": [{"content": {"parts": []}}]}"#).is_err());
        assert!(candidate_text("not json").is_err());
    }

    #[test]
    fn garbage_verdict_is_an_error() {
        assert!(parse_verdict("I think it's an invoice").is_err());
    }

    #[test]
    fn create_oracle_falls_back_to_rules() {
        let oracle = create_oracle(&OracleConfig::default());
        assert_eq!(oracle.name(), "rules");

        let oracle = create_oracle(&OracleConfig {
            gemini_api_key: Some(SecretString::from("test-key")),
            ..OracleConfig::default()
        });
        assert_eq!(oracle.name(), "gemini");
    }

    #[test]
    fn model_prefix_is_stripped() {
        let oracle = GeminiOracle::new(SecretString::from("k"), "gemini/gemini-2.0-flash")
            .with_api_base("http://localhost:9/");
        assert_eq!(oracle.model, "gemini-2.0-flash");
        assert_eq!(oracle.api_base, "http://localhost:9");
    }
}
