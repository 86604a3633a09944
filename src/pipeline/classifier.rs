//! Format and intent classification on top of an inference oracle.
//!
//! Classification never fails a task. Oracle errors, timeouts and labels
//! outside the vocabulary all degrade to `Unknown` for the affected label.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::pipeline::types::{Classification, OracleVerdict, RawInput};
use crate::task::model::{Format, Intent};

/// External source of format/intent judgements.
#[async_trait]
pub trait InferenceOracle: Send + Sync {
    /// Oracle name for logs.
    fn name(&self) -> &str;

    /// Produce raw labels for an input.
    async fn infer(&self, input: &RawInput) -> Result<OracleVerdict, OracleError>;
}

/// Wraps an oracle with the fallback policy.
pub struct Classifier {
    oracle: Arc<dyn InferenceOracle>,
    timeout: Duration,
    confidence_threshold: f32,
}

impl Classifier {
    pub fn new(oracle: Arc<dyn InferenceOracle>, timeout: Duration, confidence_threshold: f32) -> Self {
        Self {
            oracle,
            timeout,
            confidence_threshold,
        }
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    /// Classify an input. Infallible by construction.
    pub async fn classify(&self, input: &RawInput) -> Classification {
        let verdict = match tokio::time::timeout(self.timeout, self.oracle.infer(input)).await {
            Ok(Ok(verdict)) => Some(verdict),
            Ok(Err(e)) => {
                warn!(oracle = self.oracle.name(), error = %e, "Oracle failed, classifying as Unknown");
                None
            }
            Err(_) => {
                let e = OracleError::Timeout {
                    oracle: self.oracle.name().to_string(),
                    after: self.timeout,
                };
                warn!(error = %e, "Oracle timed out, classifying as Unknown");
                None
            }
        };

        let mut classification = match verdict {
            Some(v) => self.interpret(v),
            None => Classification::unknown(),
        };

        if let Some(hint) = input.metadata.format_hint {
            if hint != classification.format {
                debug!(oracle_format = %classification.format, hint = %hint, "Declared format overrides oracle");
            }
            classification.format = hint;
        }

        classification
    }

    fn interpret(&self, verdict: OracleVerdict) -> Classification {
        let format = Format::from_label(&verdict.format).unwrap_or_else(|| {
            warn!(label = %verdict.format, "Format label outside vocabulary");
            Format::Unknown
        });
        let mut intent = Intent::from_label(&verdict.intent).unwrap_or_else(|| {
            warn!(label = %verdict.intent, "Intent label outside vocabulary");
            Intent::Unknown
        });

        let confidence = if verdict.confidence.is_finite() {
            verdict.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if confidence < self.confidence_threshold && intent != Intent::Unknown {
            debug!(
                intent = %intent,
                confidence,
                threshold = self.confidence_threshold,
                "Low confidence, intent downgraded to Unknown"
            );
            intent = Intent::Unknown;
        }

        Classification {
            format,
            intent,
            confidence,
        }
    }
}
