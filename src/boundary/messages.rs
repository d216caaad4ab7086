//! Boundary protocol messages.
//!
//! A correlation id is assigned once when a request is initiated and echoed
//! unchanged on every later message for that request, including redeliveries.

use crate::resilience::ErrorStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Work handed to a separately deployed executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProcessRequest {
    pub workflow_id: String,
    pub item_ids: Vec<String>,
    pub input: Value,
    pub timeout: Duration,

    /// Strategy applied when the delegated run fails
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
}

impl SubProcessRequest {
    pub fn new(workflow_id: impl Into<String>, item_ids: Vec<String>, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            item_ids,
            input,
            timeout: Duration::from_secs(30),
            error_strategy: ErrorStrategy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }
}

/// Final answer for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProcessResponse {
    pub correlation_id: Uuid,
    pub success: bool,
    pub output: Value,
    pub steps_executed: u32,
    pub steps_succeeded: u32,
    pub steps_failed: u32,

    /// Outputs of the steps that succeeded before a failure
    pub partial_result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProcessInitiated {
    pub correlation_id: Uuid,
    pub workflow_id: String,
    pub item_ids: Vec<String>,
    pub input: Value,
    pub timeout_ms: u64,

    /// 0 on first delivery, incremented on every retry
    pub redelivery: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProcessCompleted {
    pub correlation_id: Uuid,
    pub workflow_id: String,
    pub output: Value,
    pub steps_executed: u32,
    pub steps_succeeded: u32,
    pub steps_failed: u32,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProcessFailed {
    pub correlation_id: Uuid,
    pub workflow_id: String,
    pub error_code: String,
    pub message: String,
    pub partial_result: Option<Value>,

    /// Delivery this failure answers, echoed from `SubProcessInitiated`
    #[serde(default)]
    pub redelivery: u32,
    pub timestamp: DateTime<Utc>,
}

/// Any of the three protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum BoundaryMessage {
    Initiated(SubProcessInitiated),
    Completed(SubProcessCompleted),
    Failed(SubProcessFailed),
}

impl BoundaryMessage {
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::Initiated(message) => message.correlation_id,
            Self::Completed(message) => message.correlation_id,
            Self::Failed(message) => message.correlation_id,
        }
    }

    /// Delivery number an `Initiated` or `Failed` message refers to
    pub fn redelivery(&self) -> Option<u32> {
        match self {
            Self::Initiated(message) => Some(message.redelivery),
            Self::Completed(_) => None,
            Self::Failed(message) => Some(message.redelivery),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initiated(_))
    }
}

impl From<&SubProcessCompleted> for SubProcessResponse {
    fn from(message: &SubProcessCompleted) -> Self {
        Self {
            correlation_id: message.correlation_id,
            success: message.steps_failed == 0,
            output: message.output.clone(),
            steps_executed: message.steps_executed,
            steps_succeeded: message.steps_succeeded,
            steps_failed: message.steps_failed,
            partial_result: None,
            error: None,
            execution_time_ms: message.execution_time_ms,
        }
    }
}
