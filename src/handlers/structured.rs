//! Structured payload handler.
//!
//! Parses the input as a JSON object and validates it against a small
//! per-intent schema of required fields. Besides the required fields it
//! reports which top-level fields were present and any anomalies (nulls,
//! empty strings, negative amounts) found along the way.

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};

use crate::error::ExtractionError;
use crate::handlers::Handler;
use crate::pipeline::types::RawInput;
use crate::task::model::{ExtractedFields, Format, Intent};

/// Expected JSON shape of a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    /// Non-empty string.
    Text,
    /// String or number.
    Identifier,
    /// Number or numeric string; normalized to a decimal string.
    Money,
    /// Non-empty array.
    List,
    /// String or object.
    Party,
}

fn required_fields(intent: Intent) -> &'static [(&'static str, FieldKind)] {
    match intent {
        Intent::Invoice => &[
            ("invoice_number", FieldKind::Identifier),
            ("amount", FieldKind::Money),
            ("currency", FieldKind::Text),
        ],
        Intent::Rfq => &[("items", FieldKind::List)],
        Intent::Complaint => &[
            ("customer", FieldKind::Party),
            ("description", FieldKind::Text),
        ],
        Intent::Regulation => &[("title", FieldKind::Text), ("jurisdiction", FieldKind::Text)],
        Intent::Other | Intent::Unknown => &[],
    }
}

/// Handler for `StructuredData` inputs.
#[derive(Debug, Default)]
pub struct StructuredDataHandler;

impl StructuredDataHandler {
    pub fn new() -> Self {
        Self
    }

    fn extract(&self, text: &str, intent: Intent) -> Result<ExtractedFields, ExtractionError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ExtractionError::MalformedInput {
            reason: format!("invalid JSON: {e}"),
        })?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(ExtractionError::SchemaInvalid {
                    reason: format!("expected a JSON object, found {}", type_name(&other)),
                });
            }
        };

        let mut out = ExtractedFields::new();
        for (field, kind) in required_fields(intent) {
            let value = match object.get(*field) {
                None | Some(Value::Null) => {
                    return Err(ExtractionError::MissingRequiredField {
                        field: (*field).to_string(),
                    });
                }
                Some(v) => v,
            };
            let normalized = check_field(field, *kind, value)?;
            out.insert((*field).to_string(), normalized.clone());
            if *kind == FieldKind::Money {
                object.insert((*field).to_string(), normalized);
            }
        }

        let anomalies = find_anomalies(&object);
        let mut present: Vec<&String> = object.keys().collect();
        present.sort();

        out.insert("fields".into(), json!(present));
        out.insert("anomalies".into(), json!(anomalies));
        out.insert("data".into(), Value::Object(object));
        Ok(out)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn check_field(field: &str, kind: FieldKind, value: &Value) -> Result<Value, ExtractionError> {
    let wrong_type = |expected: &str| ExtractionError::SchemaInvalid {
        reason: format!("field '{field}' must be {expected}, found {}", type_name(value)),
    };

    match (kind, value) {
        (FieldKind::Text, Value::String(s)) if !s.trim().is_empty() => Ok(value.clone()),
        (FieldKind::Text, Value::String(_)) => Err(ExtractionError::MissingRequiredField {
            field: field.to_string(),
        }),
        (FieldKind::Text, _) => Err(wrong_type("a string")),

        (FieldKind::Identifier, Value::String(s)) if !s.trim().is_empty() => Ok(value.clone()),
        (FieldKind::Identifier, Value::String(_)) => Err(ExtractionError::MissingRequiredField {
            field: field.to_string(),
        }),
        (FieldKind::Identifier, Value::Number(_)) => Ok(value.clone()),
        (FieldKind::Identifier, _) => Err(wrong_type("a string or number")),

        (FieldKind::Money, Value::Number(n)) => parse_decimal(field, &n.to_string()),
        (FieldKind::Money, Value::String(s)) => parse_decimal(field, s.trim()),
        (FieldKind::Money, _) => Err(wrong_type("a number or numeric string")),

        (FieldKind::List, Value::Array(items)) if !items.is_empty() => Ok(value.clone()),
        (FieldKind::List, Value::Array(_)) => Err(ExtractionError::MissingRequiredField {
            field: field.to_string(),
        }),
        (FieldKind::List, _) => Err(wrong_type("an array")),

        (FieldKind::Party, Value::String(s)) if !s.trim().is_empty() => Ok(value.clone()),
        (FieldKind::Party, Value::Object(_)) => Ok(value.clone()),
        (FieldKind::Party, Value::String(_)) => Err(ExtractionError::MissingRequiredField {
            field: field.to_string(),
        }),
        (FieldKind::Party, _) => Err(wrong_type("a string or object")),
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Value, ExtractionError> {
    let raw = raw.replace(',', "");
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map(|d| Value::String(d.normalize().to_string()))
        .map_err(|_| ExtractionError::SchemaInvalid {
            reason: format!("field '{field}' is not a valid decimal amount: '{raw}'"),
        })
}

fn find_anomalies(object: &Map<String, Value>) -> Vec<String> {
    let mut anomalies = Vec::new();
    let mut keys: Vec<&String> = object.keys().collect();
    keys.sort();

    for key in keys {
        match &object[key.as_str()] {
            Value::Null => anomalies.push(format!("field '{key}' is null")),
            Value::String(s) if s.trim().is_empty() => {
                anomalies.push(format!("field '{key}' is empty"))
            }
            Value::Array(a) if a.is_empty() => anomalies.push(format!("field '{key}' is an empty list")),
            _ => {}
        }
    }

    if let Some(Value::String(amount)) = object.get("amount") {
        if Decimal::from_str(amount).is_ok_and(|d| d.is_sign_negative() && !d.is_zero()) {
            anomalies.push("amount is negative".to_string());
        }
    } else if let Some(Value::Number(n)) = object.get("amount") {
        if n.as_f64().is_some_and(|f| f < 0.0) {
            anomalies.push("amount is negative".to_string());
        }
    }

    anomalies
}

#[async_trait]
impl Handler for StructuredDataHandler {
    fn name(&self) -> &str {
        "structured_data"
    }

    async fn process(
        &self,
        input: &RawInput,
        _format: Format,
        intent: Intent,
    ) -> Result<ExtractedFields, ExtractionError> {
        self.extract(&input.text(), intent)
    }
}
