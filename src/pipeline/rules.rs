//! Rule-based inference oracle.
//!
//! Used when no LLM is configured, and as a cheap deterministic oracle in
//! tests. Format is sniffed from the content itself:
//! - `%PDF` magic → PDF
//! - leading `{` or `[` → JSON (even when it fails to parse; the handler
//!   reports the syntax error)
//! - RFC 822 `From:`/`Subject:` headers, or an address plus one of those
//!   markers → EMAIL
//! - anything else → TEXT
//!
//! Intent comes from keyword rules; the intent with the most hits wins and
//! more hits mean higher confidence.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::OracleError;
use crate::pipeline::classifier::InferenceOracle;
use crate::pipeline::types::{OracleVerdict, RawInput};
use crate::task::model::{Format, Intent};

/// A keyword rule voting for one intent.
#[derive(Debug, Clone)]
pub struct IntentRule {
    pub intent: Intent,
    pub regex: Regex,
}

/// Keyword and sniffing oracle.
pub struct RuleOracle {
    intent_rules: Vec<IntentRule>,
    header_line: Option<Regex>,
}

const DEFAULT_INTENT_PATTERNS: &[(Intent, &str)] = &[
    (
        Intent::Invoice,
        r"(?i)\b(invoice|invoice_number|amount due|payment due|billing|remit)\b",
    ),
    (
        Intent::Rfq,
        r"(?i)\b(rfq|request for (a )?quot(e|ation)|quotation|please quote|price quote)\b",
    ),
    (
        Intent::Complaint,
        r"(?i)\b(complain(t|ts|ing)?|dissatisfied|unacceptable|refund|defective|disappointed)\b",
    ),
    (
        Intent::Regulation,
        r"(?i)\b(regulation|regulatory|compliance|directive|jurisdiction|statute|gdpr)\b",
    ),
];

impl RuleOracle {
    /// Oracle with the built-in intent keywords.
    pub fn default_rules() -> Self {
        let intent_rules = DEFAULT_INTENT_PATTERNS
            .iter()
            .filter_map(|(intent, pattern)| {
                Regex::new(pattern).ok().map(|regex| IntentRule {
                    intent: *intent,
                    regex,
                })
            })
            .collect();
        Self::with_rules(intent_rules)
    }

    /// Oracle with custom intent rules.
    pub fn with_rules(intent_rules: Vec<IntentRule>) -> Self {
        Self {
            intent_rules,
            header_line: Regex::new(r"(?m)^(From|Subject|To|Date):[ \t]*\S").ok(),
        }
    }

    /// Sniff a format label from content and declared content type.
    pub fn sniff_format(&self, input: &RawInput) -> &'static str {
        if let Some(declared) = input
            .metadata
            .content_type
            .as_deref()
            .and_then(Format::from_label)
        {
            return match declared {
                Format::StructuredData => "JSON",
                Format::Correspondence => "EMAIL",
                Format::Document => "TEXT",
                Format::Unknown => "UNKNOWN",
            };
        }

        if input.content.starts_with(b"%PDF") {
            return "PDF";
        }

        let text = input.text();
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return "JSON";
        }

        let has_headers = self
            .header_line
            .as_ref()
            .is_some_and(|re| re.find_iter(&text).take(2).count() >= 2);
        let loose_email = text.contains('@') && (text.contains("Subject:") || text.contains("From:"));
        if has_headers || loose_email {
            return "EMAIL";
        }

        "TEXT"
    }

    /// Score intents by keyword hits.
    pub fn score_intent(&self, text: &str) -> (Intent, f32) {
        let mut best: Option<(Intent, usize)> = None;
        for rule in &self.intent_rules {
            let hits = rule.regex.find_iter(text).count();
            if hits > 0 && best.is_none_or(|(_, n)| hits > n) {
                best = Some((rule.intent, hits));
            }
        }

        match best {
            Some((intent, hits)) => {
                let confidence = (0.6 + 0.1 * (hits.min(4) - 1) as f32).min(0.9);
                (intent, confidence)
            }
            None => (Intent::Other, 0.5),
        }
    }
}

#[async_trait]
impl InferenceOracle for RuleOracle {
    fn name(&self) -> &str {
        "rules"
    }

    async fn infer(&self, input: &RawInput) -> Result<OracleVerdict, OracleError> {
        let format = self.sniff_format(input);
        let (intent, confidence) = self.score_intent(&input.text());
        debug!(format, intent = %intent, confidence, "Rule oracle verdict");
        Ok(OracleVerdict {
            format: format.to_string(),
            intent: intent.to_string(),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::DeclaredMetadata;

    fn oracle() -> RuleOracle {
        RuleOracle::default_rules()
    }

    #[test]
    fn all_default_patterns_compile() {
        assert_eq!(oracle().intent_rules.len(), DEFAULT_INTENT_PATTERNS.len());
    }

    #[test]
    fn sniffs_pdf_magic() {
        assert_eq!(oracle().sniff_format(&RawInput::new(b"%PDF-1.7\n...".to_vec())), "PDF");
    }

    #[test]
    fn sniffs_json_even_when_malformed() {
        assert_eq!(oracle().sniff_format(&RawInput::new(r#"{"a": 1}"#)), "JSON");
        assert_eq!(oracle().sniff_format(&RawInput::new("  [1, 2")), "JSON");
        assert_eq!(oracle().sniff_format(&RawInput::new("{invoice_number: ")), "JSON");
    }

    #[test]
    fn sniffs_email_headers() {
        let raw = "From: alice@example.com\nSubject: Quote\n\nPlease quote 500 units.";
        assert_eq!(oracle().sniff_format(&RawInput::new(raw)), "EMAIL");
    }

    #[test]
    fn single_header_without_address_is_text() {
        assert_eq!(oracle().sniff_format(&RawInput::new("Subject: notes\n\nhello")), "TEXT");
    }

    #[test]
    fn plain_text_is_text() {
        assert_eq!(oracle().sniff_format(&RawInput::new("Quarterly summary of results.")), "TEXT");
    }

    #[test]
    fn content_type_wins_over_sniffing() {
        let input = RawInput::new("plain words").with_metadata(DeclaredMetadata {
            content_type: Some("application/json".into()),
            ..Default::default()
        });
        assert_eq!(oracle().sniff_format(&input), "JSON");
    }

    #[test]
    fn intent_keywords() {
        let o = oracle();
        assert_eq!(o.score_intent("Please find the invoice attached").0, Intent::Invoice);
        assert_eq!(o.score_intent("RFQ: please quote 500 units").0, Intent::Rfq);
        assert_eq!(o.score_intent("This is unacceptable, I want a refund").0, Intent::Complaint);
        assert_eq!(o.score_intent("New GDPR directive for the EU jurisdiction").0, Intent::Regulation);
        assert_eq!(o.score_intent("Lunch on Friday?"), (Intent::Other, 0.5));
    }

    #[test]
    fn more_hits_more_confidence() {
        let o = oracle();
        let (_, one) = o.score_intent("refund");
        let (_, three) = o.score_intent("refund, defective, unacceptable");
        assert!(three > one);
        assert!(three <= 0.9);
    }

    #[tokio::test]
    async fn infer_produces_vocabulary_labels() {
        let verdict = oracle()
            .infer(&RawInput::new(r#"{"invoice_number": "INV-1", "amount": 10}"#))
            .await
            .unwrap();
        assert_eq!(verdict.format, "JSON");
        assert_eq!(verdict.intent, "Invoice");
        assert_eq!(Format::from_label(&verdict.format), Some(Format::StructuredData));
    }
}
