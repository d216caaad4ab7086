//! Event value types.

use crate::boundary::{
    BoundaryMessage, SubProcessCompleted, SubProcessFailed, SubProcessInitiated,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    SubprocessInitiated,
    SubprocessCompleted,
    SubprocessFailed,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::WorkflowStarted,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::WorkflowCancelled,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::StepSkipped,
        EventType::SubprocessInitiated,
        EventType::SubprocessCompleted,
        EventType::SubprocessFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::WorkflowFailed => "WORKFLOW_FAILED",
            Self::WorkflowCancelled => "WORKFLOW_CANCELLED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepSkipped => "STEP_SKIPPED",
            Self::SubprocessInitiated => "SUBPROCESS_INITIATED",
            Self::SubprocessCompleted => "SUBPROCESS_COMPLETED",
            Self::SubprocessFailed => "SUBPROCESS_FAILED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Workflow {
        items: usize,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    Step {
        step_id: String,
        adapter: Option<String>,
        retry_count: u32,
        execution_time_ms: u64,
        message: Option<String>,
    },
    SubprocessInitiated(SubProcessInitiated),
    SubprocessCompleted(SubProcessCompleted),
    SubprocessFailed(SubProcessFailed),
}

/// Event published on the bus; never modified after construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub correlation_id: Uuid,
    pub workflow_id: Option<String>,
    pub item_id: Option<String>,
    pub status: String,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(
        event_type: EventType,
        correlation_id: Uuid,
        status: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            correlation_id,
            workflow_id: None,
            item_id: None,
            status: status.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn subprocess_initiated(message: SubProcessInitiated) -> Self {
        Self::new(
            EventType::SubprocessInitiated,
            message.correlation_id,
            "INITIATED",
            EventPayload::SubprocessInitiated(message.clone()),
        )
        .with_workflow(message.workflow_id)
    }

    pub fn subprocess_completed(message: SubProcessCompleted) -> Self {
        Self::new(
            EventType::SubprocessCompleted,
            message.correlation_id,
            "COMPLETED",
            EventPayload::SubprocessCompleted(message.clone()),
        )
        .with_workflow(message.workflow_id)
    }

    pub fn subprocess_failed(message: SubProcessFailed) -> Self {
        Self::new(
            EventType::SubprocessFailed,
            message.correlation_id,
            "FAILED",
            EventPayload::SubprocessFailed(message.clone()),
        )
        .with_workflow(message.workflow_id)
    }

    pub fn from_boundary_message(message: BoundaryMessage) -> Self {
        match message {
            BoundaryMessage::Initiated(message) => Self::subprocess_initiated(message),
            BoundaryMessage::Completed(message) => Self::subprocess_completed(message),
            BoundaryMessage::Failed(message) => Self::subprocess_failed(message),
        }
    }

    /// The boundary message carried by a subprocess event, if any
    pub fn boundary_message(&self) -> Option<BoundaryMessage> {
        match &self.payload {
            EventPayload::SubprocessInitiated(message) => {
                Some(BoundaryMessage::Initiated(message.clone()))
            }
            EventPayload::SubprocessCompleted(message) => {
                Some(BoundaryMessage::Completed(message.clone()))
            }
            EventPayload::SubprocessFailed(message) => Some(BoundaryMessage::Failed(message.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_serialization() {
        let json = serde_json::to_string(&EventType::SubprocessFailed).unwrap();
        assert_eq!(json, "\"SUBPROCESS_FAILED\"");
        assert_eq!(EventType::StepSkipped.to_string(), "STEP_SKIPPED");
        assert_eq!(EventType::ALL.len(), 11);
    }

    #[test]
    fn test_event_builders() {
        let correlation_id = Uuid::new_v4();
        let event = EngineEvent::new(
            EventType::StepCompleted,
            correlation_id,
            "COMPLETED",
            EventPayload::Step {
                step_id: "ocr.scan".to_string(),
                adapter: Some("ocr".to_string()),
                retry_count: 0,
                execution_time_ms: 12,
                message: None,
            },
        )
        .with_workflow("wf-1")
        .with_item("Q1");

        assert_eq!(event.correlation_id, correlation_id);
        assert_eq!(event.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(event.item_id.as_deref(), Some("Q1"));
    }
}
