//! # Workflow Orchestrator
//!
//! Top-level driver for one batch of items.
//!
//! Every item's context is fetched and its chain planned before the workflow
//! is created, so configuration errors abort the run before anything is
//! dispatched. Items are then dispatched in declared order: each one is checked
//! against the completed set, run through the [`DependencyScheduler`] and folded
//! into the [`StateStore`] as a single step result keyed by item id.
//!
//! Item outcome rules:
//! - at least one failed step and no completed step: FAILED
//! - every step skipped: SKIPPED
//! - anything else: COMPLETED
//!
//! The workflow ends FAILED when no item completed and at least one failed,
//! otherwise COMPLETED. A COMPLETED workflow may still report failed and
//! skipped items.

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, EventPayload, EventType};
use crate::logging::{log_error, log_workflow_operation};
use crate::orchestration::scheduler::{
    ChainContext, ChainExecution, DependencyScheduler, DispatchGate,
};
use crate::orchestration::types::WorkflowResult;
use crate::registry::{ContextProvider, ItemContext};
use crate::resilience::ErrorStrategy;
use crate::state::{StateStore, StepResult, StepStatus, WorkflowState, WorkflowStatus};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ITEMS_KEY: &str = "items";
const CORRELATION_KEY: &str = "correlation_id";

pub struct WorkflowOrchestrator {
    store: Arc<StateStore>,
    scheduler: Arc<DependencyScheduler>,
    contexts: Arc<dyn ContextProvider>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<StateStore>,
        scheduler: Arc<DependencyScheduler>,
        contexts: Arc<dyn ContextProvider>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            scheduler,
            contexts,
            events,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<DependencyScheduler> {
        &self.scheduler
    }

    /// Create the workflow and run every item to a terminal outcome
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        items: Vec<String>,
        source_document: Value,
    ) -> EngineResult<WorkflowResult> {
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();

        let contexts = match self.load_contexts(&items).await {
            Ok(contexts) => contexts,
            Err(e) => {
                log_error(
                    "orchestrator",
                    "execute_workflow",
                    &e.to_string(),
                    Some(&format!("workflow_id={workflow_id}")),
                );
                return Err(e);
            }
        };

        let mut metadata = Map::new();
        metadata.insert(ITEMS_KEY.to_string(), json!(items));
        metadata.insert(
            CORRELATION_KEY.to_string(),
            Value::String(correlation_id.to_string()),
        );
        self.store.create(workflow_id, metadata).await?;
        let state = self
            .store
            .set_status(workflow_id, WorkflowStatus::Running, Some(1))
            .await?;

        info!(
            workflow_id = %workflow_id,
            correlation_id = %correlation_id,
            items = items.len(),
            "Workflow started"
        );
        self.publish_workflow_event(EventType::WorkflowStarted, &state, correlation_id);

        self.run_items(workflow_id, contexts, &source_document, correlation_id, started)
            .await
    }

    /// Continue a paused, interrupted or restarted workflow.
    ///
    /// Items already terminal are not dispatched again. A workflow not live in
    /// this process is recovered from the durable sink first.
    pub async fn resume_workflow(
        &self,
        workflow_id: &str,
        source_document: Value,
    ) -> EngineResult<WorkflowResult> {
        let started = Instant::now();
        let state = self.store.recover(workflow_id).await?;
        let correlation_id = workflow_correlation(&state);

        if state.status.is_terminal() {
            debug!(workflow_id = %workflow_id, status = %state.status, "Workflow already terminal");
            return Ok(WorkflowResult::from_state(&state, correlation_id, 0));
        }

        let items: Vec<String> = state
            .metadata
            .get(ITEMS_KEY)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| {
                EngineError::InvalidState(format!("workflow {workflow_id} has no item list"))
            })?;
        let contexts = self.load_contexts(&items).await?;

        let state = match state.status {
            WorkflowStatus::Paused => self.store.resume(workflow_id).await?,
            WorkflowStatus::Created => {
                self.store
                    .set_status(workflow_id, WorkflowStatus::Running, Some(state.version))
                    .await?
            }
            _ => state,
        };

        log_workflow_operation(
            "resume",
            workflow_id,
            Some(state.version),
            &state.status.to_string(),
            Some(&format!("{} recorded item(s)", state.step_results.len())),
        );
        self.publish_workflow_event(EventType::WorkflowStarted, &state, correlation_id);

        self.run_items(workflow_id, contexts, &source_document, correlation_id, started)
            .await
    }

    /// Stop dispatching new items and later waves of running chains. Calls
    /// already in flight still complete.
    pub async fn cancel(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        let state = self.store.cancel(workflow_id).await?;
        let correlation_id = workflow_correlation(&state);
        self.publish_workflow_event(EventType::WorkflowCancelled, &state, correlation_id);
        Ok(state)
    }

    pub async fn pause(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        self.store.pause(workflow_id).await
    }

    /// Fetch every context and plan every chain; any configuration error aborts
    async fn load_contexts(&self, items: &[String]) -> EngineResult<Vec<ItemContext>> {
        let mut seen = HashSet::new();
        let mut contexts = Vec::with_capacity(items.len());
        for item_id in items {
            if !seen.insert(item_id.as_str()) {
                return Err(EngineError::configuration(format!(
                    "item '{item_id}' listed more than once"
                )));
            }
            let context = self.contexts.get_context(item_id).await?;
            self.scheduler.plan_waves(&context.execution_chain)?;
            contexts.push(context);
        }
        Ok(contexts)
    }

    async fn run_items(
        &self,
        workflow_id: &str,
        contexts: Vec<ItemContext>,
        source_document: &Value,
        correlation_id: Uuid,
        started: Instant,
    ) -> EngineResult<WorkflowResult> {
        let mut aborted_by: Option<String> = None;

        for context in contexts {
            let item_id = context.item_id.clone();
            let state = self.store.get(workflow_id).await?;

            if !state.status.accepts_dispatch() {
                info!(
                    workflow_id = %workflow_id,
                    status = %state.status,
                    "Dispatch stopped"
                );
                break;
            }
            if state.is_step_terminal(&item_id) {
                continue;
            }

            if let Some(failed_item) = &aborted_by {
                self.store
                    .mark_step_skipped(
                        workflow_id,
                        &item_id,
                        &format!("aborted by fail-fast after item {failed_item} failed"),
                        None,
                    )
                    .await?;
                continue;
            }

            let missing: Vec<&str> = context
                .dependencies
                .iter()
                .filter(|dependency| !state.completed.contains(*dependency))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                debug!(
                    workflow_id = %workflow_id,
                    item_id = %item_id,
                    missing = ?missing,
                    "Item skipped, dependencies not completed"
                );
                self.store
                    .mark_step_skipped(
                        workflow_id,
                        &item_id,
                        &format!("unmet dependencies: {}", missing.join(", ")),
                        None,
                    )
                    .await?;
                continue;
            }

            self.store.mark_step_running(workflow_id, &item_id, None).await?;

            let chain_context =
                ChainContext::new(workflow_id, context.clone(), source_document.clone())
                    .with_correlation_id(correlation_id)
                    .with_gate(Arc::clone(&self.store) as Arc<dyn DispatchGate>);
            let chain = self
                .scheduler
                .execute_chain(&context.execution_chain, &chain_context)
                .await?;

            let result = item_result(&item_id, &chain);
            let item_failed = result.status == StepStatus::Failed;
            self.store.record_step_result(workflow_id, result, None).await?;

            if item_failed && context.error_strategy == ErrorStrategy::FailFast {
                warn!(
                    workflow_id = %workflow_id,
                    item_id = %item_id,
                    "Item failed under FAIL_FAST, aborting remaining items"
                );
                aborted_by = Some(item_id);
            }
        }

        let state = self.finalize(workflow_id).await?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match state.status {
            WorkflowStatus::Completed => {
                self.publish_workflow_event(EventType::WorkflowCompleted, &state, correlation_id)
            }
            WorkflowStatus::Failed => {
                self.publish_workflow_event(EventType::WorkflowFailed, &state, correlation_id)
            }
            _ => {}
        }
        log_workflow_operation(
            "execute",
            workflow_id,
            Some(state.version),
            &state.status.to_string(),
            Some(&format!(
                "completed={} failed={} skipped={} execution_time_ms={}",
                state.completed.len(),
                state.failed.len(),
                state.skipped.len(),
                execution_time_ms
            )),
        );

        Ok(WorkflowResult::from_state(
            &state,
            correlation_id,
            execution_time_ms,
        ))
    }

    /// Settle the overall status unless the workflow was paused or cancelled meanwhile
    async fn finalize(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowState>> {
        loop {
            let state = self.store.get(workflow_id).await?;
            if !state.status.accepts_dispatch() {
                return Ok(state);
            }
            let status = if state.completed.is_empty() && !state.failed.is_empty() {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };
            match self
                .store
                .set_status(workflow_id, status, Some(state.version))
                .await
            {
                Ok(state) => return Ok(state),
                Err(EngineError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn publish_workflow_event(
        &self,
        event_type: EventType,
        state: &WorkflowState,
        correlation_id: Uuid,
    ) {
        let items = state
            .metadata
            .get(ITEMS_KEY)
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let event = EngineEvent::new(
            event_type,
            correlation_id,
            state.status.to_string(),
            EventPayload::Workflow {
                items,
                completed: state.completed.len(),
                failed: state.failed.len(),
                skipped: state.skipped.len(),
            },
        )
        .with_workflow(state.workflow_id.as_str());
        self.events.publish(event);
    }
}

fn workflow_correlation(state: &WorkflowState) -> Uuid {
    state
        .metadata
        .get(CORRELATION_KEY)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .unwrap_or_else(Uuid::new_v4)
}

/// Fold a chain run into the item's step result
fn item_result(item_id: &str, chain: &ChainExecution) -> StepResult {
    let output = json!({
        "correlation_id": chain.correlation_id,
        "steps": chain.outputs(),
        "completed": chain.completed,
        "failed": chain.failed,
        "skipped": chain.skipped,
    });

    let reasons = |ids: &[String]| -> String {
        ids.iter()
            .filter_map(|id| chain.results.get(id))
            .map(|step| {
                format!(
                    "{}: {}",
                    step.step_id,
                    step.error.as_deref().unwrap_or("no detail")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    };

    let result = if !chain.failed.is_empty() && chain.completed.is_empty() {
        StepResult::failed(item_id, reasons(&chain.failed)).with_output(output)
    } else if chain.completed.is_empty() && !chain.order.is_empty() {
        StepResult::skipped(item_id, reasons(&chain.skipped)).with_output(output)
    } else {
        StepResult::completed(item_id, output)
    };

    result
        .with_retry_count(chain.retry_count())
        .with_execution_time_ms(chain.execution_time_ms)
        .with_validity(chain.all_valid())
}
