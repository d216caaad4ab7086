//! Error types for the Wavefront engine.
//!
//! Engine-level failures are surfaced as [`EngineError`]. Adapter failures never
//! travel through this type: they are caught by the resilience layer and turned
//! into typed step outcomes (see [`crate::registry::AdapterError`]).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Fatal setup problem: cyclic DAG, unknown adapter/method reference, bad config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Workflow {workflow_id} already exists")]
    DuplicateWorkflow { workflow_id: String },

    #[error("Workflow {workflow_id} not found")]
    WorkflowNotFound { workflow_id: String },

    /// Optimistic concurrency check failed; retry the mutation with a fresh version.
    #[error("Version conflict for workflow {workflow_id}: expected {expected}, found {actual}")]
    VersionConflict {
        workflow_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unresolved argument in step {step}: no result for '{reference}'")]
    UnresolvedArgument { step: String, reference: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Boundary error: {0}")]
    Boundary(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Whether the caller may retry the same operation with refreshed inputs
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Persistence(_))
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::config::ConfigurationError> for EngineError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        EngineError::Configuration(error.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
