//! # Module Controller
//!
//! The single invocation boundary between the engine and adapters. Every
//! adapter call made by the scheduler passes through [`ModuleController::invoke`],
//! which injects workflow context, applies resilience, normalizes the output
//! and folds the validator's verdict into the returned status.
//!
//! Per-adapter performance counters are kept for the lifetime of the
//! controller and can be read back with [`ModuleController::performance_report`].

use crate::config::ModuleControllerConfig;
use crate::logging::log_step_operation;
use crate::registry::{
    AdapterError, AdapterRegistry, AdapterResult, InvocationStatus, ItemContext, Kwargs,
    OutputValidator, ValidationVerdict,
};
use crate::resilience::{
    FailureKind, ResilienceManager, ResilienceOutcome, ResilienceRequest, RetryPolicy,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One adapter call as seen by the controller
#[derive(Debug, Clone)]
pub struct InvocationRequest<'a> {
    pub adapter: &'a str,
    pub method: &'a str,
    pub context: &'a ItemContext,
    pub workflow_id: Option<&'a str>,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,

    /// Overrides the controller's default policy for this call
    pub retry_policy: Option<RetryPolicy>,
}

impl<'a> InvocationRequest<'a> {
    pub fn new(adapter: &'a str, method: &'a str, context: &'a ItemContext) -> Self {
        Self {
            adapter,
            method,
            context,
            workflow_id: None,
            args: Vec::new(),
            kwargs: Kwargs::new(),
            retry_policy: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: &'a str) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_retry_policy(mut self, policy: Option<RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    fn step_id(&self) -> String {
        format!("{}.{}", self.adapter, self.method)
    }
}

/// Normalized result of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    pub output: AdapterResult,
    pub validation: ValidationVerdict,
    pub retry_count: u32,
    pub failure_kind: Option<FailureKind>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl InvocationResult {
    /// Whether downstream steps may consume `output.data`
    pub fn produced_output(&self) -> bool {
        matches!(
            self.status,
            InvocationStatus::Success | InvocationStatus::Degraded
        )
    }

    fn empty(status: InvocationStatus, kind: Option<FailureKind>, error: String) -> Self {
        Self {
            status,
            output: AdapterResult {
                status,
                data: Value::Null,
                evidence: Vec::new(),
                confidence: 0.0,
                errors: vec![error.clone()],
                warnings: Vec::new(),
            },
            validation: ValidationVerdict::default(),
            retry_count: 0,
            failure_kind: kind,
            error: Some(error),
            execution_time_ms: 0,
        }
    }
}

/// Rolling per-adapter counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterPerformance {
    pub adapter: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub degraded: u64,
    pub skipped: u64,
    pub circuit_open: u64,
    pub retries: u64,
    pub total_execution_time_ms: u64,
}

impl AdapterPerformance {
    pub fn average_execution_time_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_execution_time_ms as f64 / self.calls as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    fn record(&mut self, result: &InvocationResult) {
        self.calls += 1;
        self.retries += result.retry_count as u64;
        self.total_execution_time_ms += result.execution_time_ms;
        match result.status {
            InvocationStatus::Success => self.successes += 1,
            InvocationStatus::Failure => self.failures += 1,
            InvocationStatus::Degraded => self.degraded += 1,
            InvocationStatus::Skipped => self.skipped += 1,
            InvocationStatus::CircuitOpen => self.circuit_open += 1,
        }
    }
}

pub struct ModuleController {
    registry: Arc<dyn AdapterRegistry>,
    resilience: Arc<ResilienceManager>,
    validator: Arc<dyn OutputValidator>,
    config: ModuleControllerConfig,
    default_policy: RetryPolicy,
    performance: DashMap<String, AdapterPerformance>,
}

impl std::fmt::Debug for ModuleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleController")
            .field("config", &self.config)
            .field("default_policy", &self.default_policy)
            .field("adapters_seen", &self.performance.len())
            .finish()
    }
}

impl ModuleController {
    pub fn new(
        registry: Arc<dyn AdapterRegistry>,
        resilience: Arc<ResilienceManager>,
        validator: Arc<dyn OutputValidator>,
        config: ModuleControllerConfig,
    ) -> Self {
        Self {
            registry,
            resilience,
            validator,
            config,
            default_policy: RetryPolicy::default(),
            performance: DashMap::new(),
        }
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn resilience_enabled(&self) -> bool {
        self.config.resilience_enabled
    }

    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    pub fn registry(&self) -> &Arc<dyn AdapterRegistry> {
        &self.registry
    }

    pub fn method_exists(&self, adapter: &str, method: &str) -> bool {
        self.registry.method_exists(adapter, method)
    }

    /// Invoke one adapter method. Never returns an adapter error; every
    /// failure is expressed through [`InvocationResult::status`].
    pub async fn invoke(&self, request: InvocationRequest<'_>) -> InvocationResult {
        let started = Instant::now();
        let step_id = request.step_id();
        let kwargs = self.prepare_kwargs(&request);
        let policy = request
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_policy.clone());

        // Last output the validator rejected, kept so the final result can report it
        let rejected: Mutex<Option<(AdapterResult, ValidationVerdict)>> = Mutex::new(None);

        let mut result = if self.config.resilience_enabled {
            let resilience_request = ResilienceRequest::new(step_id.as_str(), request.adapter)
                .with_policy(policy)
                .with_error_strategy(request.context.error_strategy)
                .with_compensation_context(json!({
                    "item_id": request.context.item_id,
                    "workflow_id": request.workflow_id,
                    "args": request.args,
                }));

            let outcome = self
                .resilience
                .execute_with_resilience(&resilience_request, |_attempt| {
                    self.attempt(&request, kwargs.clone(), &rejected)
                })
                .await;
            self.resolve_outcome(outcome, &rejected)
        } else {
            match self.attempt(&request, kwargs, &rejected).await {
                Ok((output, validation)) => Self::from_success(output, validation, 0),
                Err(error) => {
                    let kind = self.resilience.classifier().classify(&error);
                    self.failure_result(
                        InvocationStatus::Failure,
                        kind,
                        &error,
                        0,
                        &rejected,
                    )
                }
            }
        };

        result.execution_time_ms = started.elapsed().as_millis() as u64;
        self.performance
            .entry(request.adapter.to_string())
            .or_insert_with(|| AdapterPerformance {
                adapter: request.adapter.to_string(),
                ..Default::default()
            })
            .record(&result);

        log_step_operation(
            "invoke",
            request.workflow_id,
            &step_id,
            Some(request.adapter),
            &result.status.to_string(),
            result.error.as_deref(),
        );
        result
    }

    /// Context fields are added only where the caller did not supply the key
    fn prepare_kwargs(&self, request: &InvocationRequest<'_>) -> Kwargs {
        let mut kwargs = request.kwargs.clone();
        if !self.config.inject_context {
            return kwargs;
        }
        kwargs
            .entry("item_id")
            .or_insert_with(|| Value::String(request.context.item_id.clone()));
        kwargs
            .entry("context_version")
            .or_insert_with(|| Value::String(request.context.version.clone()));
        if let Some(workflow_id) = request.workflow_id {
            kwargs
                .entry("workflow_id")
                .or_insert_with(|| Value::String(workflow_id.to_string()));
        }
        if !request.context.validation_rules.is_null() {
            kwargs
                .entry("validation_rules")
                .or_insert_with(|| request.context.validation_rules.clone());
        }
        kwargs
    }

    /// One call plus normalization and validation
    async fn attempt(
        &self,
        request: &InvocationRequest<'_>,
        kwargs: Kwargs,
        rejected: &Mutex<Option<(AdapterResult, ValidationVerdict)>>,
    ) -> Result<(AdapterResult, ValidationVerdict), AdapterError> {
        let output = self
            .registry
            .call(request.adapter, request.method, request.args.clone(), kwargs)
            .await?
            .into_result();

        if output.status == InvocationStatus::Failure {
            let message = if output.errors.is_empty() {
                format!("{}.{} reported failure", request.adapter, request.method)
            } else {
                output.errors.join("; ")
            };
            return Err(AdapterError::Unclassified(message));
        }

        let validation = self.validator.validate(&output, request.context);
        if !validation.is_valid {
            let message = validation.violations.join("; ");
            debug!(
                adapter = %request.adapter,
                method = %request.method,
                violations = %message,
                "Output rejected by validator"
            );
            *rejected.lock() = Some((output, validation));
            return Err(AdapterError::Validation(message));
        }
        Ok((output, validation))
    }

    fn resolve_outcome(
        &self,
        outcome: ResilienceOutcome<(AdapterResult, ValidationVerdict)>,
        rejected: &Mutex<Option<(AdapterResult, ValidationVerdict)>>,
    ) -> InvocationResult {
        let retry_count = outcome.retry_count();
        match outcome {
            ResilienceOutcome::Success {
                value: (output, validation),
                ..
            } => Self::from_success(output, validation, retry_count),
            ResilienceOutcome::CircuitOpen { breaker_key } => InvocationResult::empty(
                InvocationStatus::CircuitOpen,
                None,
                format!("circuit breaker open for adapter '{breaker_key}'"),
            ),
            ResilienceOutcome::Failed { kind, error, .. } => self.failure_result(
                InvocationStatus::Failure,
                kind,
                &error,
                retry_count,
                rejected,
            ),
            ResilienceOutcome::Skipped { kind, error, .. } => self.failure_result(
                InvocationStatus::Skipped,
                kind,
                &error,
                retry_count,
                rejected,
            ),
            ResilienceOutcome::Degraded {
                fallback,
                kind,
                error,
                ..
            } => {
                let mut result = self.failure_result(
                    InvocationStatus::Degraded,
                    kind,
                    &error,
                    retry_count,
                    rejected,
                );
                result.output.status = InvocationStatus::Degraded;
                result.output.data = fallback;
                result
            }
        }
    }

    fn from_success(
        output: AdapterResult,
        validation: ValidationVerdict,
        retry_count: u32,
    ) -> InvocationResult {
        let (status, error) = match output.status {
            InvocationStatus::Degraded => (InvocationStatus::Degraded, None),
            InvocationStatus::Skipped | InvocationStatus::CircuitOpen => {
                let reason = output
                    .errors
                    .iter()
                    .chain(output.warnings.iter())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ");
                let reason = if reason.is_empty() {
                    "adapter reported skipped".to_string()
                } else {
                    reason
                };
                (InvocationStatus::Skipped, Some(reason))
            }
            _ => (InvocationStatus::Success, None),
        };
        InvocationResult {
            status,
            output,
            validation,
            retry_count,
            failure_kind: None,
            error,
            execution_time_ms: 0,
        }
    }

    fn failure_result(
        &self,
        status: InvocationStatus,
        kind: FailureKind,
        error: &AdapterError,
        retry_count: u32,
        rejected: &Mutex<Option<(AdapterResult, ValidationVerdict)>>,
    ) -> InvocationResult {
        let mut result = InvocationResult::empty(status, Some(kind), error.to_string());
        result.retry_count = retry_count;
        if kind == FailureKind::Validation {
            if let Some((mut output, validation)) = rejected.lock().take() {
                output.status = status;
                result.output = output;
                result.validation = validation;
            }
        }
        result
    }

    /// Counters for one adapter
    pub fn performance(&self, adapter: &str) -> Option<AdapterPerformance> {
        self.performance.get(adapter).map(|entry| entry.value().clone())
    }

    /// Counters for every adapter called so far, sorted by adapter id
    pub fn performance_report(&self) -> Vec<AdapterPerformance> {
        let mut report: Vec<AdapterPerformance> = self
            .performance
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        report.sort_by(|a, b| a.adapter.cmp(&b.adapter));
        report
    }
}
