//! # State Store
//!
//! Versioned workflow state with optimistic concurrency.
//!
//! Writers to the same workflow id are serialized through a per-workflow
//! async mutex; writers to different ids never contend. Every successful
//! update is persisted through the [`DurableSink`] before it becomes the
//! current version, and is appended to the in-memory history.

use crate::config::{PersistenceBackend, StateStoreConfig};
use crate::error::{EngineError, EngineResult};
use crate::logging::log_workflow_operation;
use crate::state::{
    DurableSink, FileSystemSink, InMemorySink, StateChange, StepResult, WorkflowState,
    WorkflowStateDocument, WorkflowStatus,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
struct WorkflowEntry {
    current: Arc<WorkflowState>,
    history: Vec<Arc<WorkflowState>>,
}

impl WorkflowEntry {
    fn new(state: Arc<WorkflowState>) -> Self {
        Self {
            current: Arc::clone(&state),
            history: vec![state],
        }
    }
}

/// Store of every live workflow's state and history
pub struct StateStore {
    entries: DashMap<String, Arc<Mutex<WorkflowEntry>>>,
    sink: Arc<dyn DurableSink>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("workflows", &self.entries.len())
            .field("sink", &self.sink.sink_name())
            .finish()
    }
}

impl StateStore {
    pub fn new(sink: Arc<dyn DurableSink>) -> Self {
        Self {
            entries: DashMap::new(),
            sink,
        }
    }

    /// Store backed by an [`InMemorySink`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySink::new()))
    }

    pub fn from_config(config: &StateStoreConfig) -> Self {
        let sink: Arc<dyn DurableSink> = match config.backend {
            PersistenceBackend::Memory => Arc::new(InMemorySink::new()),
            PersistenceBackend::File => Arc::new(FileSystemSink::new(config.directory_path())),
        };
        info!(sink = sink.sink_name(), "State store initialized");
        Self::new(sink)
    }

    pub fn sink(&self) -> &Arc<dyn DurableSink> {
        &self.sink
    }

    /// Create version 1 of a new workflow
    pub async fn create(
        &self,
        workflow_id: &str,
        metadata: Map<String, Value>,
    ) -> EngineResult<Arc<WorkflowState>> {
        let state = Arc::new(WorkflowState::new(workflow_id, metadata));
        let entry = Arc::new(Mutex::new(WorkflowEntry::new(Arc::clone(&state))));

        // Hold the entry lock until persisted so readers never see an unpersisted version
        let guard = match self.entries.entry(workflow_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::DuplicateWorkflow {
                    workflow_id: workflow_id.to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                let guard = Arc::clone(&entry).try_lock_owned().map_err(|_| {
                    EngineError::InvalidState(format!("workflow {workflow_id} is locked"))
                })?;
                vacant.insert(entry);
                guard
            }
        };

        if let Err(e) = self.sink.persist(&WorkflowStateDocument::from(&*state)).await {
            drop(guard);
            self.entries.remove(workflow_id);
            return Err(e);
        }
        drop(guard);

        log_workflow_operation("create", workflow_id, Some(state.version), "CREATED", None);
        Ok(state)
    }

    fn entry(&self, workflow_id: &str) -> EngineResult<Arc<Mutex<WorkflowEntry>>> {
        self.entries
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    pub async fn get(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        let entry = self.entry(workflow_id)?;
        let guard = entry.lock().await;
        Ok(Arc::clone(&guard.current))
    }

    /// Every version of the workflow, oldest first
    pub async fn history(&self, workflow_id: &str) -> EngineResult<Vec<Arc<WorkflowState>>> {
        let entry = self.entry(workflow_id)?;
        let guard = entry.lock().await;
        Ok(guard.history.clone())
    }

    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Apply `changes` as the next version.
    ///
    /// With `expected_version`, fails with `VersionConflict` and leaves the
    /// stored state untouched unless it matches the current version.
    pub async fn update(
        &self,
        workflow_id: &str,
        changes: Vec<StateChange>,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        let entry = self.entry(workflow_id)?;
        let mut guard = entry.lock().await;

        if let Some(expected) = expected_version {
            if expected != guard.current.version {
                debug!(
                    workflow_id = workflow_id,
                    expected = expected,
                    actual = guard.current.version,
                    "Rejected stale update"
                );
                return Err(EngineError::VersionConflict {
                    workflow_id: workflow_id.to_string(),
                    expected,
                    actual: guard.current.version,
                });
            }
        }

        let next = guard.current.apply(&changes)?;
        self.sink.persist(&WorkflowStateDocument::from(&next)).await?;

        let next = Arc::new(next);
        guard.history.push(Arc::clone(&next));
        guard.current = Arc::clone(&next);
        drop(guard);

        log_workflow_operation(
            "update",
            workflow_id,
            Some(next.version),
            &next.status.to_string(),
            Some(&format!("{} change(s)", changes.len())),
        );
        Ok(next)
    }

    /// Record any step result, moving the id into the matching set
    pub async fn record_step_result(
        &self,
        workflow_id: &str,
        result: StepResult,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        self.update(
            workflow_id,
            vec![StateChange::RecordStepResult(result)],
            expected_version,
        )
        .await
    }

    pub async fn mark_step_running(
        &self,
        workflow_id: &str,
        step_id: &str,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        self.record_step_result(workflow_id, StepResult::running(step_id), expected_version)
            .await
    }

    pub async fn mark_step_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
        output: Value,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        self.record_step_result(
            workflow_id,
            StepResult::completed(step_id, output),
            expected_version,
        )
        .await
    }

    pub async fn mark_step_failed(
        &self,
        workflow_id: &str,
        step_id: &str,
        error: &str,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        self.record_step_result(workflow_id, StepResult::failed(step_id, error), expected_version)
            .await
    }

    pub async fn mark_step_skipped(
        &self,
        workflow_id: &str,
        step_id: &str,
        reason: &str,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        self.record_step_result(
            workflow_id,
            StepResult::skipped(step_id, reason),
            expected_version,
        )
        .await
    }

    pub async fn set_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        expected_version: Option<u64>,
    ) -> EngineResult<Arc<WorkflowState>> {
        self.update(
            workflow_id,
            vec![StateChange::SetStatus(status)],
            expected_version,
        )
        .await
    }

    pub async fn pause(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        let current = self.get(workflow_id).await?;
        if !current.status.accepts_dispatch() {
            return Err(EngineError::InvalidState(format!(
                "cannot pause workflow {workflow_id} in status {}",
                current.status
            )));
        }
        self.set_status(workflow_id, WorkflowStatus::Paused, Some(current.version))
            .await
    }

    pub async fn resume(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        let current = self.get(workflow_id).await?;
        if current.status != WorkflowStatus::Paused {
            return Err(EngineError::InvalidState(format!(
                "cannot resume workflow {workflow_id} in status {}",
                current.status
            )));
        }
        self.set_status(workflow_id, WorkflowStatus::Running, Some(current.version))
            .await
    }

    /// Stops new dispatch. Adapter calls already in flight still complete.
    pub async fn cancel(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        let current = self.get(workflow_id).await?;
        if current.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "cannot cancel workflow {workflow_id} in status {}",
                current.status
            )));
        }
        self.set_status(workflow_id, WorkflowStatus::Cancelled, Some(current.version))
            .await
    }

    /// Install the persisted state of a workflow that is not live in this process.
    ///
    /// Returns the live state unchanged when the workflow is already loaded.
    pub async fn recover(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        if let Ok(live) = self.get(workflow_id).await {
            return Ok(live);
        }

        let document = self
            .sink
            .load(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        let state = Arc::new(WorkflowState::try_from(document)?);

        let installed = match self.entries.entry(workflow_id.to_string()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(Mutex::new(WorkflowEntry::new(Arc::clone(&state))));
                vacant.insert(Arc::clone(&entry));
                entry
            }
        };

        let guard = installed.lock().await;
        log_workflow_operation(
            "recover",
            workflow_id,
            Some(guard.current.version),
            &guard.current.status.to_string(),
            None,
        );
        Ok(Arc::clone(&guard.current))
    }
}
