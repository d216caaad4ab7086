//! # Compensation
//!
//! Best-effort undo actions registered per step. Running them is not
//! transactional: a compensation that fails is logged and recorded, and nothing
//! is rolled back on its behalf. Actions may run more than once for the same
//! step; implementations are expected to tolerate that.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Undo action for a step that already produced side effects
#[async_trait]
pub trait CompensationAction: Send + Sync {
    async fn compensate(&self, step_id: &str, context: &Value) -> Result<(), String>;

    fn description(&self) -> String {
        "compensation".to_string()
    }
}

/// Audit entry for one compensation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub step_id: String,
    pub description: String,
    pub success: bool,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

/// Registered compensation actions and their run log
#[derive(Default)]
pub struct CompensationRegistry {
    actions: DashMap<String, Arc<dyn CompensationAction>>,
    log: Mutex<Vec<CompensationRecord>>,
}

impl std::fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationRegistry")
            .field("registered", &self.actions.len())
            .field("executed", &self.log.lock().len())
            .finish()
    }
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the action for `step_id`
    pub fn register(&self, step_id: impl Into<String>, action: Arc<dyn CompensationAction>) {
        self.actions.insert(step_id.into(), action);
    }

    pub fn has_action(&self, step_id: &str) -> bool {
        self.actions.contains_key(step_id)
    }

    /// Execute the action registered for `step_id`.
    ///
    /// Returns `None` when nothing is registered.
    pub async fn run(&self, step_id: &str, context: &Value) -> Option<CompensationRecord> {
        // clone out of the map so no shard lock is held across the await
        let action = self.actions.get(step_id).map(|entry| Arc::clone(entry.value()))?;

        let started = Instant::now();
        let outcome = action.compensate(step_id, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = match outcome {
            Ok(()) => {
                info!(step_id = step_id, duration_ms, "Compensation executed");
                CompensationRecord {
                    step_id: step_id.to_string(),
                    description: action.description(),
                    success: true,
                    message: None,
                    duration_ms,
                    executed_at: Utc::now(),
                }
            }
            Err(message) => {
                warn!(step_id = step_id, error = %message, "Compensation failed");
                CompensationRecord {
                    step_id: step_id.to_string(),
                    description: action.description(),
                    success: false,
                    message: Some(message),
                    duration_ms,
                    executed_at: Utc::now(),
                }
            }
        };

        self.log.lock().push(record.clone());
        Some(record)
    }

    /// Snapshot of every compensation run so far
    pub fn log(&self) -> Vec<CompensationRecord> {
        self.log.lock().clone()
    }
}
