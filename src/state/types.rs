//! Workflow and step state values.
//!
//! [`WorkflowState`] is never mutated in place: [`WorkflowState::apply`]
//! returns the next version and leaves the receiver untouched.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl WorkflowStatus {
    /// Check if this is a terminal status (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether new steps may be dispatched
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "PAUSED" => Ok(Self::Paused),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow status: {s}")),
        }
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Retrying => write!(f, "RETRYING"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            "RETRYING" => Ok(Self::Retrying),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}

/// Immutable outcome of one step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub is_valid: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    fn with_status(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output: None,
            is_valid: true,
            error: None,
            retry_count: 0,
            execution_time_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn running(step_id: impl Into<String>) -> Self {
        Self::with_status(step_id, StepStatus::Running)
    }

    pub fn completed(step_id: impl Into<String>, output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::with_status(step_id, StepStatus::Completed)
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            is_valid: false,
            ..Self::with_status(step_id, StepStatus::Failed)
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::with_status(step_id, StepStatus::Skipped)
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_execution_time_ms(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    pub fn with_validity(mut self, is_valid: bool) -> Self {
        self.is_valid = is_valid;
        self
    }
}

/// One mutation applied by [`WorkflowState::apply`]
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    SetStatus(WorkflowStatus),
    SetCurrentStep(Option<String>),

    /// Replace the step's result and move its id into the matching set
    RecordStepResult(StepResult),
    MergeMetadata(Map<String, Value>),
}

/// Versioned state of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub version: u64,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub step_results: BTreeMap<String, StepResult>,
    pub error_count: u32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl WorkflowState {
    /// Version 1 of a new workflow
    pub fn new(workflow_id: impl Into<String>, metadata: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            version: 1,
            status: WorkflowStatus::Created,
            current_step: None,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            step_results: BTreeMap::new(),
            error_count: 0,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    /// Produce the next version with `changes` applied in order.
    pub fn apply(&self, changes: &[StateChange]) -> EngineResult<WorkflowState> {
        let mut next = self.clone();

        for change in changes {
            match change {
                StateChange::SetStatus(status) => {
                    if next.status.is_terminal() && next.status != *status {
                        return Err(EngineError::InvalidState(format!(
                            "workflow {} is {} and cannot move to {}",
                            self.workflow_id, next.status, status
                        )));
                    }
                    next.status = *status;
                }
                StateChange::SetCurrentStep(step) => {
                    next.current_step = step.clone();
                }
                StateChange::RecordStepResult(result) => next.record_step_result(result.clone()),
                StateChange::MergeMetadata(entries) => {
                    for (key, value) in entries {
                        next.metadata.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        next.version = self.version + 1;
        next.updated_at = Utc::now();
        Ok(next)
    }

    fn record_step_result(&mut self, result: StepResult) {
        let step_id = result.step_id.clone();
        self.completed.remove(&step_id);
        self.failed.remove(&step_id);
        self.skipped.remove(&step_id);

        match result.status {
            StepStatus::Completed => {
                self.completed.insert(step_id.clone());
            }
            StepStatus::Failed => {
                self.failed.insert(step_id.clone());
                self.error_count += 1;
            }
            StepStatus::Skipped => {
                self.skipped.insert(step_id.clone());
            }
            StepStatus::Pending | StepStatus::Running | StepStatus::Retrying => {
                self.current_step = Some(step_id.clone());
            }
        }

        if result.status.is_terminal() {
            self.retry_count += result.retry_count;
            if self.current_step.as_deref() == Some(step_id.as_str()) {
                self.current_step = None;
            }
        }

        self.step_results.insert(step_id, result);
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_results.get(step_id).map(|result| result.status)
    }

    /// Whether `step_id` reached a terminal step status
    pub fn is_step_terminal(&self, step_id: &str) -> bool {
        self.completed.contains(step_id)
            || self.failed.contains(step_id)
            || self.skipped.contains(step_id)
    }
}
