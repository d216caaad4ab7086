//! Output validation hook.
//!
//! Rule semantics belong to the validator implementation; the engine only
//! folds the verdict into the invocation status.

use crate::registry::{AdapterResult, ItemContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationVerdict {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    pub fn invalid(violations: Vec<String>) -> Self {
        Self {
            is_valid: false,
            violations,
            warnings: Vec::new(),
        }
    }
}

pub trait OutputValidator: Send + Sync {
    fn validate(&self, output: &AdapterResult, context: &ItemContext) -> ValidationVerdict;
}

/// Accepts every output
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

impl OutputValidator for AcceptAllValidator {
    fn validate(&self, _output: &AdapterResult, _context: &ItemContext) -> ValidationVerdict {
        ValidationVerdict::valid()
    }
}

/// Checks `{"required": [...], "min_confidence": f64}` rules against the output.
///
/// Required fields are looked up as top-level keys of `data`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFieldsValidator;

impl OutputValidator for RequiredFieldsValidator {
    fn validate(&self, output: &AdapterResult, context: &ItemContext) -> ValidationVerdict {
        let rules = &context.validation_rules;
        let mut verdict = ValidationVerdict::valid();

        if let Some(required) = rules.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                let present = output
                    .data
                    .get(field)
                    .is_some_and(|value| !value.is_null());
                if !present {
                    verdict.violations.push(format!("missing required field '{field}'"));
                }
            }
        }

        if let Some(min_confidence) = rules.get("min_confidence").and_then(Value::as_f64) {
            if output.confidence < min_confidence {
                verdict.violations.push(format!(
                    "confidence {:.2} below minimum {:.2}",
                    output.confidence, min_confidence
                ));
            }
        }

        if !output.errors.is_empty() {
            verdict
                .warnings
                .push(format!("adapter reported {} error(s)", output.errors.len()));
        }

        verdict.is_valid = verdict.violations.is_empty();
        verdict
    }
}
