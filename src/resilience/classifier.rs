//! # Failure Classification
//!
//! Maps adapter and boundary failures onto the engine's failure taxonomy and
//! answers the two questions the resilience layer cares about: may this be
//! retried, and how much does it count against the adapter's circuit.
//!
//! ```text
//! ┌─────────────────┐     ┌───────────────────┐     ┌─────────────────┐
//! │ AdapterError /  │────▶│ FailureClassifier │────▶│ FailureKind     │
//! │ boundary code   │     │                   │     │ + severity      │
//! └─────────────────┘     └───────────────────┘     └─────────────────┘
//! ```

use crate::registry::AdapterError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Transient infrastructure fault (timeouts, dropped connections)
    Technical,

    /// Exhausted quota, memory, rate limit
    Resource,

    /// Adapter output rejected by validation
    Validation,

    /// Deterministic domain failure; retrying reproduces it
    BusinessLogic,

    /// Engine-side routing or wiring fault
    ChoreographerError,
}

impl FailureKind {
    /// Whether another attempt is allowed given the retries already spent on
    /// failures of this same kind.
    pub fn is_retryable(&self, prior_retries_of_kind: u32) -> bool {
        match self {
            Self::Technical | Self::Resource => true,
            Self::Validation => prior_retries_of_kind < 1,
            Self::BusinessLogic | Self::ChoreographerError => false,
        }
    }

    pub fn severity(&self) -> FailureSeverity {
        match self {
            Self::Technical => FailureSeverity::Medium,
            Self::Resource => FailureSeverity::High,
            Self::Validation => FailureSeverity::Low,
            Self::BusinessLogic => FailureSeverity::Low,
            Self::ChoreographerError => FailureSeverity::Medium,
        }
    }

    /// Stable error code used on the boundary protocol
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Technical => "TECHNICAL_FAILURE",
            Self::Resource => "RESOURCE_FAILURE",
            Self::Validation => "VALIDATION_FAILURE",
            Self::BusinessLogic => "BUSINESS_LOGIC_FAILURE",
            Self::ChoreographerError => "CHOREOGRAPHER_ERROR",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Technical => write!(f, "technical"),
            Self::Resource => write!(f, "resource"),
            Self::Validation => write!(f, "validation"),
            Self::BusinessLogic => write!(f, "business_logic"),
            Self::ChoreographerError => write!(f, "choreographer_error"),
        }
    }
}

/// Weight of a failure inside a circuit breaker's rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FailureSeverity {
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.5,
            Self::Medium => 1.0,
            Self::High => 2.0,
            Self::Critical => 3.0,
        }
    }
}

/// Trait for failure classification strategies
pub trait FailureClassifier: Send + Sync {
    /// Classify an adapter failure
    fn classify(&self, error: &AdapterError) -> FailureKind;

    /// Classify a failure reported across the execution boundary
    fn classify_boundary(&self, error_code: &str, message: &str) -> FailureKind;

    /// Get the classifier name for identification
    fn classifier_name(&self) -> &'static str;
}

/// Default classifier: typed variants map directly, free-form messages are
/// matched against known keywords.
#[derive(Debug, Clone, Default)]
pub struct StandardFailureClassifier;

impl StandardFailureClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_message(message: &str) -> FailureKind {
        let message = message.to_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if contains_any(&["memory", "quota", "rate limit", "throttl", "exhausted", "capacity", "disk"]) {
            FailureKind::Resource
        } else if contains_any(&["validation", "schema", "malformed", "invalid output"]) {
            FailureKind::Validation
        } else if contains_any(&["business rule", "domain rule", "not applicable"]) {
            FailureKind::BusinessLogic
        } else {
            // timeouts, connection resets and anything unknown
            FailureKind::Technical
        }
    }
}

impl FailureClassifier for StandardFailureClassifier {
    fn classify(&self, error: &AdapterError) -> FailureKind {
        match error {
            AdapterError::Technical(_) => FailureKind::Technical,
            AdapterError::Resource(_) => FailureKind::Resource,
            AdapterError::Validation(_) => FailureKind::Validation,
            AdapterError::BusinessLogic(_) => FailureKind::BusinessLogic,
            AdapterError::MethodNotFound { .. } => FailureKind::ChoreographerError,
            AdapterError::Unclassified(message) => Self::classify_message(message),
        }
    }

    fn classify_boundary(&self, error_code: &str, message: &str) -> FailureKind {
        let code = error_code.to_uppercase();
        if code.starts_with("TECHNICAL") || code.starts_with("TIMEOUT") || code.starts_with("NETWORK")
        {
            FailureKind::Technical
        } else if code.starts_with("RESOURCE") || code.starts_with("RATE_LIMIT") || code.starts_with("QUOTA")
        {
            FailureKind::Resource
        } else if code.starts_with("VALIDATION") {
            FailureKind::Validation
        } else if code.starts_with("BUSINESS") {
            FailureKind::BusinessLogic
        } else if code.starts_with("CHOREOGRAPHER") || code.starts_with("CONFIG") || code.starts_with("UNRESOLVED")
        {
            FailureKind::ChoreographerError
        } else {
            Self::classify_message(message)
        }
    }

    fn classifier_name(&self) -> &'static str {
        "standard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_errors_map_directly() {
        let classifier = StandardFailureClassifier::new();
        assert_eq!(
            classifier.classify(&AdapterError::Technical("socket closed".into())),
            FailureKind::Technical
        );
        assert_eq!(
            classifier.classify(&AdapterError::BusinessLogic("no fiscal data".into())),
            FailureKind::BusinessLogic
        );
        assert_eq!(
            classifier.classify(&AdapterError::MethodNotFound {
                adapter: "nlp".into(),
                method: "tokenize".into()
            }),
            FailureKind::ChoreographerError
        );
    }

    #[test]
    fn test_unclassified_messages_use_keywords() {
        let classifier = StandardFailureClassifier::new();
        let kind = |msg: &str| classifier.classify(&AdapterError::Unclassified(msg.into()));

        assert_eq!(kind("Out of memory while parsing"), FailureKind::Resource);
        assert_eq!(kind("rate limit exceeded"), FailureKind::Resource);
        assert_eq!(kind("schema mismatch in output"), FailureKind::Validation);
        assert_eq!(kind("connection reset by peer"), FailureKind::Technical);
        assert_eq!(kind("something odd"), FailureKind::Technical);
    }

    #[test]
    fn test_boundary_codes() {
        let classifier = StandardFailureClassifier::new();
        assert_eq!(
            classifier.classify_boundary("TIMEOUT_EXCEEDED", ""),
            FailureKind::Technical
        );
        assert_eq!(
            classifier.classify_boundary("BUSINESS_LOGIC_FAILURE", ""),
            FailureKind::BusinessLogic
        );
        assert_eq!(
            classifier.classify_boundary("E42", "quota exhausted"),
            FailureKind::Resource
        );
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(FailureKind::Technical.is_retryable(10));
        assert!(FailureKind::Resource.is_retryable(3));
        assert!(FailureKind::Validation.is_retryable(0));
        assert!(!FailureKind::Validation.is_retryable(1));
        assert!(!FailureKind::BusinessLogic.is_retryable(0));
        assert!(!FailureKind::ChoreographerError.is_retryable(0));
    }

    #[test]
    fn test_severity_weights() {
        assert_eq!(FailureKind::Technical.severity().weight(), 1.0);
        assert_eq!(FailureKind::Resource.severity().weight(), 2.0);
        assert_eq!(FailureKind::Validation.severity().weight(), 0.5);
    }
}
