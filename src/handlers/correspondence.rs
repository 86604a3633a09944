//! Correspondence handler.
//!
//! Inputs with an RFC 822 header block are parsed with `mail-parser`;
//! anything else is treated as a bare message body. Extracts sender,
//! recipient, subject, urgency, sentiment, action items and the body with
//! quoted replies removed.

use async_trait::async_trait;
use mail_parser::MessageParser;
use serde_json::{Value, json};

use crate::error::ExtractionError;
use crate::handlers::Handler;
use crate::pipeline::types::RawInput;
use crate::task::model::{ExtractedFields, Format, Intent};

const HIGH_URGENCY: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "critical",
    "emergency",
    "as soon as possible",
    "right away",
];

const MEDIUM_URGENCY: &[&str] = &[
    "soon",
    "priority",
    "important",
    "deadline",
    "tomorrow",
    "this week",
    "end of day",
    "end of week",
];

const REQUEST_OPENERS: &[&str] = &[
    "please",
    "kindly",
    "could you",
    "can you",
    "would you",
    "we need",
    "i need",
    "we require",
    "let me know",
    "send",
    "provide",
    "confirm",
];

const NEGATIVE_WORDS: &[&str] = &[
    "unacceptable",
    "disappointed",
    "complaint",
    "angry",
    "refund",
    "defective",
    "broken",
    "poor",
    "terrible",
];

const POSITIVE_WORDS: &[&str] = &[
    "thanks",
    "thank you",
    "great",
    "appreciate",
    "pleased",
    "excellent",
    "happy",
];

/// Urgency inferred from keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

/// Fields pulled from a message before keyword analysis.
struct Envelope {
    sender: Option<String>,
    recipient: Option<String>,
    subject: Option<String>,
    body: String,
}

/// Handler for `Correspondence` inputs.
#[derive(Debug, Default)]
pub struct CorrespondenceHandler;

impl CorrespondenceHandler {
    pub fn new() -> Self {
        Self
    }

    fn envelope(&self, input: &RawInput) -> Envelope {
        let text = input.text();
        if looks_like_rfc822(&text) {
            if let Some(parsed) = MessageParser::default().parse(input.content.as_slice()) {
                let first_address = |addr: Option<&mail_parser::Address>| {
                    addr.and_then(|a| a.first())
                        .and_then(|a| a.address())
                        .map(|s| s.to_string())
                };
                let body = parsed
                    .body_text(0)
                    .map(|b| b.to_string())
                    .or_else(|| parsed.body_html(0).map(|h| strip_html(&h)))
                    .unwrap_or_default();
                return Envelope {
                    sender: first_address(parsed.from()),
                    recipient: first_address(parsed.to()),
                    subject: parsed.subject().map(|s| s.to_string()),
                    body,
                };
            }
        }

        let (subject, body) = split_subject_line(&text);
        Envelope {
            sender: None,
            recipient: None,
            subject,
            body: body.to_string(),
        }
    }

    fn extract(&self, input: &RawInput) -> Result<ExtractedFields, ExtractionError> {
        let envelope = self.envelope(input);
        let body = strip_quoted_text(&envelope.body);
        if body.trim().is_empty() {
            return Err(ExtractionError::MalformedInput {
                reason: "message body is empty".into(),
            });
        }

        let sender = envelope
            .sender
            .or_else(|| input.metadata.sender.clone())
            .unwrap_or_else(|| "unknown".into());
        let scan = format!(
            "{}\n{}",
            envelope.subject.as_deref().unwrap_or_default(),
            body
        )
        .to_lowercase();

        let mut out = ExtractedFields::new();
        out.insert("sender".into(), json!(sender));
        out.insert(
            "recipient".into(),
            envelope.recipient.map(Value::String).unwrap_or(Value::Null),
        );
        out.insert(
            "subject".into(),
            envelope.subject.map(Value::String).unwrap_or(Value::Null),
        );
        out.insert("urgency".into(), json!(urgency(&scan).as_str()));
        out.insert("sentiment".into(), json!(sentiment(&scan)));
        out.insert("action_items".into(), json!(action_items(&body)));
        out.insert("body".into(), json!(body));
        Ok(out)
    }
}

#[async_trait]
impl Handler for CorrespondenceHandler {
    fn name(&self) -> &str {
        "correspondence"
    }

    async fn process(
        &self,
        input: &RawInput,
        _format: Format,
        _intent: Intent,
    ) -> Result<ExtractedFields, ExtractionError> {
        self.extract(input)
    }
}

// ── Text helpers ────────────────────────────────────────────────────

/// Whether the text opens with a header block naming From, To or Subject.
fn looks_like_rfc822(text: &str) -> bool {
    let mut saw_address_header = false;
    let mut saw_any = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) && saw_any {
            continue;
        }
        let Some((name, _)) = line.split_once(':') else {
            return false;
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
        saw_any = true;
        if matches!(name.to_ascii_lowercase().as_str(), "from" | "to" | "subject") {
            saw_address_header = true;
        }
    }
    saw_address_header
}

/// Split a leading `Subject:` line off a bare body.
fn split_subject_line(text: &str) -> (Option<String>, &str) {
    if let Some(rest) = text.strip_prefix("Subject:") {
        return match rest.find('\n') {
            Some(pos) => (Some(rest[..pos].trim().to_string()), rest[pos + 1..].trim_start()),
            None => (Some(rest.trim().to_string()), ""),
        };
    }
    (None, text)
}

/// Remove quoted reply text (`>` lines and everything after an attribution).
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        if (trimmed.starts_with("On ") && trimmed.ends_with("wrote:"))
            || (trimmed.starts_with("---") && trimmed.contains("Original Message"))
        {
            break;
        }
        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    while result.first().is_some_and(|l| l.trim().is_empty()) {
        result.remove(0);
    }

    result.join("\n")
}

fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whole-word (or whole-phrase) containment on lowercase text.
fn mentions(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn urgency(text: &str) -> Urgency {
    if HIGH_URGENCY.iter().any(|w| mentions(text, w)) {
        Urgency::High
    } else if MEDIUM_URGENCY.iter().any(|w| mentions(text, w)) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn sentiment(text: &str) -> &'static str {
    let negative = NEGATIVE_WORDS.iter().filter(|w| mentions(text, w)).count();
    let positive = POSITIVE_WORDS.iter().filter(|w| mentions(text, w)).count();
    match negative.cmp(&positive) {
        std::cmp::Ordering::Greater => "Negative",
        std::cmp::Ordering::Less => "Positive",
        std::cmp::Ordering::Equal => "Neutral",
    }
}

/// Sentences that read as requests.
fn action_items(body: &str) -> Vec<String> {
    body.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let lower = s.to_lowercase();
            REQUEST_OPENERS.iter().any(|opener| {
                lower.starts_with(opener)
                    && !lower[opener.len()..]
                        .chars()
                        .next()
                        .is_some_and(char::is_alphanumeric)
            }) || mentions(&lower, "please")
        })
        .take(10)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::DeclaredMetadata;

    async fn run(input: RawInput) -> Result<ExtractedFields, ExtractionError> {
        CorrespondenceHandler::new()
            .process(&input, Format::Correspondence, Intent::Rfq)
            .await
    }

    #[tokio::test]
    async fn parses_headers() {
        let raw = "From: Alice <alice@example.com>\n\
                   To: sales@acme.test\n\
                   Subject: RFQ for 500 units\n\
                   \n\
                   Hello,\n\
                   Please quote 500 units of part X-12 by Friday.\n\
                   Thanks\n";
        let fields = run(RawInput::new(raw)).await.unwrap();
        assert_eq!(fields["sender"], "alice@example.com");
        assert_eq!(fields["recipient"], "sales@acme.test");
        assert_eq!(fields["subject"], "RFQ for 500 units");
        assert_eq!(
            fields["action_items"],
            json!(["Please quote 500 units of part X-12 by Friday"])
        );
        assert!(fields["body"].as_str().unwrap().starts_with("Hello,"));
    }

    #[tokio::test]
    async fn bare_body_uses_declared_sender() {
        let input = RawInput::new("Can you send the updated price list").with_metadata(DeclaredMetadata {
            sender: Some("bob@example.com".into()),
            ..Default::default()
        });
        let fields = run(input).await.unwrap();
        assert_eq!(fields["sender"], "bob@example.com");
        assert_eq!(fields["recipient"], Value::Null);
        assert_eq!(fields["subject"], Value::Null);
        assert_eq!(fields["action_items"], json!(["Can you send the updated price list"]));
    }

    #[tokio::test]
    async fn bare_body_without_sender_is_unknown() {
        let fields = run(RawInput::new("Subject: hi\nJust checking in")).await.unwrap();
        assert_eq!(fields["sender"], "unknown");
        assert_eq!(fields["subject"], "hi");
        assert_eq!(fields["body"], "Just checking in");
    }

    #[tokio::test]
    async fn empty_body_is_malformed() {
        let err = run(RawInput::new("From: a@b.test\nSubject: nothing\n\n> quoted only\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedInput { .. }));
    }

    #[test]
    fn urgency_levels() {
        assert_eq!(urgency("this is urgent"), Urgency::High);
        assert_eq!(urgency("need it by end of week"), Urgency::Medium);
        assert_eq!(urgency("no rush at all"), Urgency::Low);
        // "soon" inside "sooner" is not a hit; "sooner" alone stays Low.
        assert_eq!(urgency("sooner or later"), Urgency::Low);
    }

    #[test]
    fn sentiment_balance() {
        assert_eq!(sentiment("this is unacceptable and defective"), "Negative");
        assert_eq!(sentiment("thanks, great work"), "Positive");
        assert_eq!(sentiment("the meeting is at noon"), "Neutral");
    }

    #[test]
    fn strips_quotes_and_attribution() {
        let body = "New text\n\nOn Mon, Jan 1 Alice wrote:\n> old\nold too";
        assert_eq!(strip_quoted_text(body), "New text");
        let body = "Hi\n--- Original Message ---\nolder";
        assert_eq!(strip_quoted_text(body), "Hi");
    }

    #[test]
    fn rfc822_detection() {
        assert!(looks_like_rfc822("From: a@b\nSubject: x\n\nbody"));
        assert!(looks_like_rfc822("Received: by mx\n  continued\nTo: a@b\n\nbody"));
        assert!(!looks_like_rfc822("Dear team: the report is attached"));
        assert!(!looks_like_rfc822("X-Custom: 1\n\nbody"));
    }

    #[test]
    fn html_is_flattened() {
        assert_eq!(strip_html("<p>Hello <b>there</b></p>"), "Hello there");
    }
}
