//! # Orchestration Types
//!
//! Read-only snapshots handed back to callers of the orchestrator.

use crate::state::{StepResult, WorkflowState, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Terminal (or paused/cancelled) view of one workflow run.
///
/// `success` mirrors a COMPLETED status; a completed workflow may still list
/// failed and skipped items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub correlation_id: Uuid,
    pub status: WorkflowStatus,
    pub success: bool,
    pub version: u64,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub execution_time_ms: u64,
    pub step_results: BTreeMap<String, StepResult>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn from_state(state: &WorkflowState, correlation_id: Uuid, execution_time_ms: u64) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            correlation_id,
            status: state.status,
            success: state.status == WorkflowStatus::Completed,
            version: state.version,
            completed: state.completed.iter().cloned().collect(),
            failed: state.failed.iter().cloned().collect(),
            skipped: state.skipped.iter().cloned().collect(),
            execution_time_ms,
            step_results: state.step_results.clone(),
            finished_at: Utc::now(),
        }
    }

    pub fn total_items(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }
}
