//! # Dependency Scheduler
//!
//! Runs one item's execution chain in dependency waves.
//!
//! ## Wave planning
//!
//! Chain steps are placed into waves before anything is dispatched. A step
//! lands one wave after every earlier step whose output it references and
//! every earlier step whose adapter is a transitive upstream of its own in
//! the [`DependencyGraph`]. Forward references, references to unknown steps
//! and duplicate `adapter.method` entries are configuration errors and abort
//! the chain before any adapter is called.
//!
//! ## Per-step pre-flight
//!
//! 1. Resolve argument sources. A back-reference to a step without output
//!    produces a FAILED step carrying the unresolved-argument error.
//! 2. Check the adapter exposes the method. Missing methods are SKIPPED.
//! 3. Consult the adapter's circuit breaker. An open breaker produces a
//!    SKIPPED step annotated "circuit breaker open"; no call is made and no
//!    failure is recorded.
//! 4. Invoke through the [`ModuleController`].
//!
//! Steps of one wave run concurrently, bounded by a semaphore sized from
//! `scheduler.max_concurrency`. Waves run strictly in order. When the chain
//! context carries a [`DispatchGate`], it is consulted before every wave and
//! a halt marks every remaining step SKIPPED without calling it.

use crate::boundary::{BoundaryMessage, SubProcessCompleted, SubProcessFailed};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, EventPayload, EventType};
use crate::logging::log_step_operation;
use crate::orchestration::dag::DependencyGraph;
use crate::orchestration::module_controller::{InvocationRequest, ModuleController};
use crate::registry::{ArgumentSource, ChainStep, InvocationStatus, ItemContext};
use crate::resilience::{CircuitBreakerRegistry, FailureKind};
use crate::state::{StateStore, StepResult, StepStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

/// Message recorded on steps refused by an open breaker
pub const CIRCUIT_OPEN_MESSAGE: &str = "circuit breaker open";

/// Consulted before every wave. A returned reason stops further dispatch.
#[async_trait]
pub trait DispatchGate: Send + Sync {
    async fn halt_reason(&self, workflow_id: &str) -> Option<String>;
}

/// Halts once the workflow reaches a terminal status, e.g. CANCELLED
#[async_trait]
impl DispatchGate for StateStore {
    async fn halt_reason(&self, workflow_id: &str) -> Option<String> {
        match self.get(workflow_id).await {
            Ok(state) if state.status.is_terminal() => Some(format!(
                "workflow {}",
                state.status.to_string().to_lowercase()
            )),
            Ok(_) => None,
            Err(e) => Some(format!("workflow state unavailable: {e}")),
        }
    }
}

/// Everything a chain run needs besides its steps
#[derive(Clone)]
pub struct ChainContext {
    pub workflow_id: String,
    pub item: ItemContext,
    pub correlation_id: Uuid,

    /// Value substituted for [`ArgumentSource::SourceDocument`]
    pub source_document: Value,
    gate: Option<Arc<dyn DispatchGate>>,
}

impl std::fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainContext")
            .field("workflow_id", &self.workflow_id)
            .field("item_id", &self.item.item_id)
            .field("correlation_id", &self.correlation_id)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

impl ChainContext {
    pub fn new(workflow_id: impl Into<String>, item: ItemContext, source_document: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            item,
            correlation_id: Uuid::new_v4(),
            source_document,
            gate: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn DispatchGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    async fn halt_reason(&self) -> Option<String> {
        match &self.gate {
            Some(gate) => gate.halt_reason(&self.workflow_id).await,
            None => None,
        }
    }
}

/// Outcome of one chain step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub adapter: String,
    pub method: String,
    pub wave: u32,
    pub status: StepStatus,
    pub invocation_status: Option<InvocationStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,
    pub is_valid: bool,
    pub execution_time_ms: u64,
}

impl StepExecution {
    fn new(step: &ChainStep, wave: u32, status: StepStatus) -> Self {
        Self {
            step_id: step.step_id(),
            adapter: step.adapter.clone(),
            method: step.method.clone(),
            wave,
            status,
            invocation_status: None,
            output: None,
            error: None,
            failure_kind: None,
            retry_count: 0,
            is_valid: status != StepStatus::Failed,
            execution_time_ms: 0,
        }
    }

    fn skipped(step: &ChainStep, wave: u32, reason: impl Into<String>) -> Self {
        let mut execution = Self::new(step, wave, StepStatus::Skipped);
        execution.error = Some(reason.into());
        execution
    }

    fn failed(step: &ChainStep, wave: u32, error: impl Into<String>) -> Self {
        let mut execution = Self::new(step, wave, StepStatus::Failed);
        execution.error = Some(error.into());
        execution
    }

    /// State-store form of this step
    pub fn to_step_result(&self) -> StepResult {
        let result = match self.status {
            StepStatus::Completed => {
                StepResult::completed(self.step_id.as_str(), self.output.clone().unwrap_or_default())
            }
            StepStatus::Skipped => {
                StepResult::skipped(self.step_id.as_str(), self.error.clone().unwrap_or_default())
            }
            _ => StepResult::failed(self.step_id.as_str(), self.error.clone().unwrap_or_default()),
        };
        result
            .with_retry_count(self.retry_count)
            .with_execution_time_ms(self.execution_time_ms)
            .with_validity(self.is_valid)
    }
}

/// Aggregate of one chain run, keyed by `adapter.method`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecution {
    pub correlation_id: Uuid,
    pub workflow_id: String,
    pub item_id: String,
    pub results: BTreeMap<String, StepExecution>,

    /// Step ids in declared order
    pub order: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub execution_time_ms: u64,
}

impl ChainExecution {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn retry_count(&self) -> u32 {
        self.results.values().map(|step| step.retry_count).sum()
    }

    pub fn all_valid(&self) -> bool {
        self.results.values().all(|step| step.is_valid)
    }

    /// Outputs of completed steps keyed by step id
    pub fn outputs(&self) -> Map<String, Value> {
        self.order
            .iter()
            .filter_map(|step_id| self.results.get(step_id))
            .filter(|step| step.status == StepStatus::Completed)
            .map(|step| {
                (
                    step.step_id.clone(),
                    step.output.clone().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Completed or Failed message summarizing the run
    pub fn boundary_message(&self) -> BoundaryMessage {
        let steps_succeeded = self.completed.len() as u32;
        let steps_failed = self.failed.len() as u32;

        if self.failed.is_empty() {
            return BoundaryMessage::Completed(SubProcessCompleted {
                correlation_id: self.correlation_id,
                workflow_id: self.workflow_id.clone(),
                output: Value::Object(self.outputs()),
                steps_executed: steps_succeeded + steps_failed,
                steps_succeeded,
                steps_failed,
                execution_time_ms: self.execution_time_ms,
                timestamp: Utc::now(),
            });
        }

        let first_failure = self
            .failed
            .first()
            .and_then(|step_id| self.results.get(step_id));
        let error_code = first_failure
            .and_then(|step| step.failure_kind)
            .map(|kind| kind.error_code().to_string())
            .unwrap_or_else(|| "STEP_FAILURE".to_string());
        let details: Vec<String> = self
            .failed
            .iter()
            .filter_map(|step_id| self.results.get(step_id))
            .map(|step| {
                format!(
                    "{}: {}",
                    step.step_id,
                    step.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();
        let outputs = self.outputs();

        BoundaryMessage::Failed(SubProcessFailed {
            correlation_id: self.correlation_id,
            workflow_id: self.workflow_id.clone(),
            error_code,
            message: format!(
                "{} of {} steps failed: {}",
                steps_failed,
                self.order.len(),
                details.join("; ")
            ),
            partial_result: (!outputs.is_empty()).then(|| Value::Object(outputs)),
            redelivery: 0,
            timestamp: Utc::now(),
        })
    }
}

pub struct DependencyScheduler {
    graph: Arc<DependencyGraph>,
    controller: Arc<ModuleController>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl std::fmt::Debug for DependencyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyScheduler")
            .field("adapters", &self.graph.len())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl DependencyScheduler {
    pub fn new(
        graph: Arc<DependencyGraph>,
        controller: Arc<ModuleController>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<EventBus>,
        max_concurrency: usize,
    ) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            graph,
            controller,
            breakers,
            events,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn controller(&self) -> &Arc<ModuleController> {
        &self.controller
    }

    /// Adapter topological order of the underlying graph
    pub fn execution_order(&self) -> Vec<String> {
        self.graph.execution_order()
    }

    /// Place chain steps into waves; returns step indices per wave in declared order
    pub fn plan_waves(&self, steps: &[ChainStep]) -> EngineResult<Vec<Vec<usize>>> {
        let step_ids: Vec<String> = steps.iter().map(ChainStep::step_id).collect();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, step_id) in step_ids.iter().enumerate() {
            if positions.insert(step_id.as_str(), index).is_some() {
                return Err(EngineError::configuration(format!(
                    "step '{step_id}' appears more than once in the chain"
                )));
            }
        }

        let mut waves_of: Vec<usize> = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let mut wave = 0usize;

            for reference in step.references() {
                match positions.get(reference) {
                    Some(&upstream) if upstream < index => {
                        wave = wave.max(waves_of[upstream] + 1);
                    }
                    Some(_) => {
                        return Err(EngineError::configuration(format!(
                            "step '{}' references later step '{reference}'",
                            step_ids[index]
                        )))
                    }
                    None => {
                        return Err(EngineError::configuration(format!(
                            "step '{}' references unknown step '{reference}'",
                            step_ids[index]
                        )))
                    }
                }
            }

            for (other, other_step) in steps.iter().enumerate() {
                if other == index || !self.graph.depends_on(&step.adapter, &other_step.adapter) {
                    continue;
                }
                if other > index {
                    return Err(EngineError::configuration(format!(
                        "step '{}' is declared before its upstream '{}'",
                        step_ids[index], step_ids[other]
                    )));
                }
                wave = wave.max(waves_of[other] + 1);
            }

            waves_of.push(wave);
        }

        let wave_count = waves_of.iter().max().map_or(0, |max| max + 1);
        let mut waves = vec![Vec::new(); wave_count];
        for (index, wave) in waves_of.into_iter().enumerate() {
            waves[wave].push(index);
        }
        Ok(waves)
    }

    /// Run the chain and publish one Completed or Failed boundary event for it
    pub async fn execute_chain(
        &self,
        steps: &[ChainStep],
        context: &ChainContext,
    ) -> EngineResult<ChainExecution> {
        let execution = self.run_chain(steps, context).await?;
        let event = EngineEvent::from_boundary_message(execution.boundary_message())
            .with_item(context.item.item_id.as_str());
        self.events.publish(event);
        Ok(execution)
    }

    /// Run the chain without publishing a boundary event
    pub async fn run_chain(
        &self,
        steps: &[ChainStep],
        context: &ChainContext,
    ) -> EngineResult<ChainExecution> {
        let started = Instant::now();
        let waves = self.plan_waves(steps)?;

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut results: BTreeMap<String, StepExecution> = BTreeMap::new();

        for (index, wave) in waves.iter().enumerate() {
            let wave_number = index as u32 + 1;
            if let Some(reason) = context.halt_reason().await {
                info!(
                    workflow_id = %context.workflow_id,
                    item_id = %context.item.item_id,
                    wave = wave_number,
                    reason = %reason,
                    "Dispatch halted, remaining steps skipped"
                );
                for (offset, remaining) in waves[index..].iter().enumerate() {
                    for &position in remaining {
                        let execution = StepExecution::skipped(
                            &steps[position],
                            wave_number + offset as u32,
                            format!("dispatch halted: {reason}"),
                        );
                        self.publish_step_event(EventType::StepSkipped, &execution, context);
                        results.insert(execution.step_id.clone(), execution);
                    }
                }
                break;
            }

            debug!(
                workflow_id = %context.workflow_id,
                item_id = %context.item.item_id,
                correlation_id = %context.correlation_id,
                wave = wave_number,
                steps = wave.len(),
                "Dispatching wave"
            );

            let executions = join_all(
                wave.iter()
                    .map(|&position| self.run_step(&steps[position], wave_number, &outputs, context)),
            )
            .await;

            for execution in executions {
                if execution.status == StepStatus::Completed {
                    if let Some(output) = &execution.output {
                        outputs.insert(execution.step_id.clone(), output.clone());
                    }
                }
                results.insert(execution.step_id.clone(), execution);
            }
        }

        let order: Vec<String> = steps.iter().map(ChainStep::step_id).collect();
        let mut chain = ChainExecution {
            correlation_id: context.correlation_id,
            workflow_id: context.workflow_id.clone(),
            item_id: context.item.item_id.clone(),
            results,
            order,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            execution_time_ms: started.elapsed().as_millis() as u64,
        };
        for step_id in &chain.order {
            match chain.results.get(step_id).map(|step| step.status) {
                Some(StepStatus::Completed) => chain.completed.push(step_id.clone()),
                Some(StepStatus::Skipped) => chain.skipped.push(step_id.clone()),
                Some(_) => chain.failed.push(step_id.clone()),
                None => {}
            }
        }

        info!(
            workflow_id = %context.workflow_id,
            item_id = %context.item.item_id,
            correlation_id = %context.correlation_id,
            completed = chain.completed.len(),
            failed = chain.failed.len(),
            skipped = chain.skipped.len(),
            execution_time_ms = chain.execution_time_ms,
            "Chain finished"
        );
        Ok(chain)
    }

    async fn run_step(
        &self,
        step: &ChainStep,
        wave: u32,
        outputs: &HashMap<String, Value>,
        context: &ChainContext,
    ) -> StepExecution {
        let execution = self.execute_step(step, wave, outputs, context).await;

        let event_type = match execution.status {
            StepStatus::Completed => EventType::StepCompleted,
            StepStatus::Skipped => EventType::StepSkipped,
            _ => EventType::StepFailed,
        };
        self.publish_step_event(event_type, &execution, context);
        log_step_operation(
            "execute_step",
            Some(&context.workflow_id),
            &execution.step_id,
            Some(&execution.adapter),
            &execution.status.to_string(),
            execution.error.as_deref(),
        );
        execution
    }

    async fn execute_step(
        &self,
        step: &ChainStep,
        wave: u32,
        outputs: &HashMap<String, Value>,
        context: &ChainContext,
    ) -> StepExecution {
        let step_id = step.step_id();

        let args = match resolve_arguments(&step_id, &step.args, outputs, &context.source_document)
        {
            Ok(args) => args,
            Err(error) => return StepExecution::failed(step, wave, error.to_string()),
        };

        if !self.controller.method_exists(&step.adapter, &step.method) {
            return StepExecution::skipped(
                step,
                wave,
                format!("adapter method '{step_id}' is not available"),
            );
        }

        if !self.breakers.can_execute(&step.adapter) {
            debug!(
                step_id = %step_id,
                adapter = %step.adapter,
                correlation_id = %context.correlation_id,
                "Step skipped, circuit open"
            );
            let mut execution = StepExecution::skipped(step, wave, CIRCUIT_OPEN_MESSAGE);
            execution.invocation_status = Some(InvocationStatus::CircuitOpen);
            return execution;
        }

        let _permit = self.permits.acquire().await.ok();
        self.publish_step_event(
            EventType::StepStarted,
            &StepExecution::new(step, wave, StepStatus::Running),
            context,
        );

        let invocation = self
            .controller
            .invoke(
                InvocationRequest::new(&step.adapter, &step.method, &context.item)
                    .with_workflow(&context.workflow_id)
                    .with_args(args)
                    .with_kwargs(step.kwargs.clone())
                    .with_retry_policy(step.retry_policy.clone()),
            )
            .await;

        if !self.controller.resilience_enabled() {
            match (invocation.status, invocation.failure_kind) {
                (InvocationStatus::Success | InvocationStatus::Degraded, _) => {
                    self.breakers.record_success(&step.adapter)
                }
                (InvocationStatus::Failure, Some(kind)) => {
                    self.breakers.record_failure(&step.adapter, kind.severity())
                }
                _ => {}
            }
        }

        let status = match invocation.status {
            InvocationStatus::Success | InvocationStatus::Degraded => StepStatus::Completed,
            InvocationStatus::Failure => StepStatus::Failed,
            InvocationStatus::Skipped | InvocationStatus::CircuitOpen => StepStatus::Skipped,
        };
        let mut execution = StepExecution::new(step, wave, status);
        execution.invocation_status = Some(invocation.status);
        execution.retry_count = invocation.retry_count;
        execution.execution_time_ms = invocation.execution_time_ms;
        execution.failure_kind = invocation.failure_kind;
        execution.is_valid = invocation.validation.is_valid && status != StepStatus::Failed;
        let produced_output = invocation.produced_output();
        execution.error = match invocation.status {
            InvocationStatus::CircuitOpen => Some(CIRCUIT_OPEN_MESSAGE.to_string()),
            _ => invocation.error,
        };
        if produced_output {
            execution.output = Some(invocation.output.data);
        }
        execution
    }

    fn publish_step_event(
        &self,
        event_type: EventType,
        execution: &StepExecution,
        context: &ChainContext,
    ) {
        let event = EngineEvent::new(
            event_type,
            context.correlation_id,
            execution.status.to_string(),
            EventPayload::Step {
                step_id: execution.step_id.clone(),
                adapter: Some(execution.adapter.clone()),
                retry_count: execution.retry_count,
                execution_time_ms: execution.execution_time_ms,
                message: execution.error.clone(),
            },
        )
        .with_workflow(context.workflow_id.as_str())
        .with_item(context.item.item_id.as_str());
        self.events.publish(event);
    }
}

fn resolve_arguments(
    step_id: &str,
    sources: &[ArgumentSource],
    outputs: &HashMap<String, Value>,
    source_document: &Value,
) -> EngineResult<Vec<Value>> {
    sources
        .iter()
        .map(|source| match source {
            ArgumentSource::Literal { value } => Ok(value.clone()),
            ArgumentSource::SourceDocument => Ok(source_document.clone()),
            ArgumentSource::StepOutput { step, path } => {
                let unresolved = || EngineError::UnresolvedArgument {
                    step: step_id.to_string(),
                    reference: match path {
                        Some(path) => format!("{step}{path}"),
                        None => step.clone(),
                    },
                };
                let output = outputs.get(step).ok_or_else(unresolved)?;
                match path {
                    Some(pointer) => output.pointer(pointer).cloned().ok_or_else(unresolved),
                    None => Ok(output.clone()),
                }
            }
        })
        .collect()
}
