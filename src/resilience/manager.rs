//! # Resilience Manager
//!
//! Wraps a single adapter operation with breaker admission, retries,
//! failure classification and the item's error strategy. Adapter errors stop
//! here: callers receive a [`ResilienceOutcome`], never an `AdapterError`
//! propagated through `?`.
//!
//! The same decision table serves failures reported across the execution
//! boundary through [`ResilienceManager::handle_boundary_failure`].

use crate::boundary::SubProcessFailed;
use crate::logging::log_error;
use crate::registry::AdapterError;
use crate::resilience::{
    CircuitBreakerRegistry, CompensationAction, CompensationRecord, CompensationRegistry,
    ErrorStrategy, FailureClassifier, FailureKind, RetryPolicy, StandardFailureClassifier,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Append-only record of one failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: FailureKind,
    pub step_id: String,
    pub attempt: u32,
    pub message: String,
}

/// Aggregate counters across every operation the manager has run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub compensations_run: u64,
    pub compensations_failed: u64,
}

/// Parameters for one resilient execution
#[derive(Debug, Clone)]
pub struct ResilienceRequest {
    /// Step identifier used in failure records and compensation lookup
    pub step_id: String,

    /// Breaker consulted before every attempt, normally the adapter id
    pub breaker_key: String,

    pub policy: RetryPolicy,
    pub error_strategy: ErrorStrategy,

    /// Passed to the compensation action when one runs
    pub compensation_context: Value,
}

impl ResilienceRequest {
    pub fn new(step_id: impl Into<String>, breaker_key: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            breaker_key: breaker_key.into(),
            policy: RetryPolicy::default(),
            error_strategy: ErrorStrategy::default(),
            compensation_context: Value::Null,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    pub fn with_compensation_context(mut self, context: Value) -> Self {
        self.compensation_context = context;
        self
    }
}

/// Final, typed result of a resilient execution
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceOutcome<T> {
    Success {
        value: T,
        attempts: u32,
    },

    /// Admission refused before any attempt was made
    CircuitOpen { breaker_key: String },

    Failed {
        kind: FailureKind,
        error: AdapterError,
        attempts: u32,
        compensation: Option<CompensationRecord>,
    },

    Skipped {
        kind: FailureKind,
        error: AdapterError,
        attempts: u32,
    },

    /// Retries exhausted, fallback value substituted
    Degraded {
        fallback: Value,
        kind: FailureKind,
        error: AdapterError,
        attempts: u32,
    },
}

impl<T> ResilienceOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Skipped { attempts, .. }
            | Self::Degraded { attempts, .. } => *attempts,
            Self::CircuitOpen { .. } => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Retries consumed beyond the first attempt
    pub fn retry_count(&self) -> u32 {
        self.attempts().saturating_sub(1)
    }
}

/// Inputs for deciding how to react to a boundary failure
#[derive(Debug, Clone)]
pub struct BoundaryFailureContext {
    pub error_strategy: ErrorStrategy,

    /// How many times this request has already been re-sent
    pub redelivery_count: u32,
    pub max_redeliveries: u32,

    /// Policy used to space redeliveries
    pub policy: RetryPolicy,

    /// Key used for fallback lookup, normally the workflow or item id
    pub fallback_key: String,
}

/// Reaction to a failed delegated execution
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryDecision {
    Retry { delay: Duration },
    FallbackWithPartial { partial: Value },
    FallbackWithDegraded { value: Value },
    Compensate,
    Skip,
    Fail { kind: FailureKind },
}

impl BoundaryDecision {
    /// Whether the pending request stays open for a redelivery
    pub fn keeps_request_pending(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Retry, classification and compensation driver shared by every workflow
pub struct ResilienceManager {
    breakers: Arc<CircuitBreakerRegistry>,
    classifier: Arc<dyn FailureClassifier>,
    compensations: CompensationRegistry,
    fallbacks: DashMap<String, Value>,
    failure_log: Mutex<Vec<FailureRecord>>,
    stats: Mutex<ResilienceStats>,
}

impl std::fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("classifier", &self.classifier.classifier_name())
            .field("breakers", &self.breakers)
            .field("compensations", &self.compensations)
            .finish()
    }
}

impl ResilienceManager {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self::with_classifier(breakers, Arc::new(StandardFailureClassifier::new()))
    }

    pub fn with_classifier(
        breakers: Arc<CircuitBreakerRegistry>,
        classifier: Arc<dyn FailureClassifier>,
    ) -> Self {
        Self {
            breakers,
            classifier,
            compensations: CompensationRegistry::new(),
            fallbacks: DashMap::new(),
            failure_log: Mutex::new(Vec::new()),
            stats: Mutex::new(ResilienceStats::default()),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn classifier(&self) -> &Arc<dyn FailureClassifier> {
        &self.classifier
    }

    /// Run `operation` under breaker admission, retry policy and error strategy.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute_with_resilience<T, F, Fut>(
        &self,
        request: &ResilienceRequest,
        mut operation: F,
    ) -> ResilienceOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let max_attempts = request.policy.effective_max_attempts();
        let mut retries_by_kind: HashMap<FailureKind, u32> = HashMap::new();
        let mut attempt = 0u32;
        let mut last_failure: Option<(FailureKind, AdapterError)> = None;

        loop {
            if !self.breakers.try_acquire(&request.breaker_key) {
                self.stats.lock().circuit_rejections += 1;
                match last_failure.take() {
                    None => {
                        debug!(
                            step_id = %request.step_id,
                            adapter = %request.breaker_key,
                            "Circuit open, no attempt made"
                        );
                        return ResilienceOutcome::CircuitOpen {
                            breaker_key: request.breaker_key.clone(),
                        };
                    }
                    Some((kind, error)) => {
                        warn!(
                            step_id = %request.step_id,
                            adapter = %request.breaker_key,
                            attempts = attempt,
                            "Circuit opened between retries, giving up"
                        );
                        return self.apply_error_strategy(request, kind, error, attempt).await;
                    }
                }
            }

            attempt += 1;
            self.stats.lock().attempts += 1;

            match operation(attempt).await {
                Ok(value) => {
                    self.breakers.record_success(&request.breaker_key);
                    self.stats.lock().successes += 1;
                    if attempt > 1 {
                        info!(
                            step_id = %request.step_id,
                            adapter = %request.breaker_key,
                            attempts = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return ResilienceOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    let kind = self.classifier.classify(&error);
                    self.breakers
                        .record_failure(&request.breaker_key, kind.severity());
                    self.record_failure(&request.step_id, kind, attempt, &error.to_string());

                    let prior_retries = retries_by_kind.get(&kind).copied().unwrap_or(0);
                    if attempt < max_attempts && kind.is_retryable(prior_retries) {
                        retries_by_kind.insert(kind, prior_retries + 1);
                        self.stats.lock().retries += 1;

                        let delay = request.policy.delay_for_attempt(attempt);
                        debug!(
                            step_id = %request.step_id,
                            adapter = %request.breaker_key,
                            attempt = attempt,
                            failure_kind = %kind,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying after failure"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        last_failure = Some((kind, error));
                        continue;
                    }

                    return self.apply_error_strategy(request, kind, error, attempt).await;
                }
            }
        }
    }

    async fn apply_error_strategy<T>(
        &self,
        request: &ResilienceRequest,
        kind: FailureKind,
        error: AdapterError,
        attempts: u32,
    ) -> ResilienceOutcome<T> {
        log_error(
            "resilience_manager",
            "execute_with_resilience",
            &error.to_string(),
            Some(&format!(
                "step_id={} kind={} attempts={} strategy={}",
                request.step_id, kind, attempts, request.error_strategy
            )),
        );

        match request.error_strategy {
            ErrorStrategy::FailFast => ResilienceOutcome::Failed {
                kind,
                error,
                attempts,
                compensation: None,
            },
            ErrorStrategy::Skip => ResilienceOutcome::Skipped {
                kind,
                error,
                attempts,
            },
            ErrorStrategy::Fallback => ResilienceOutcome::Degraded {
                fallback: self.fallback_for(&request.breaker_key),
                kind,
                error,
                attempts,
            },
            ErrorStrategy::Compensate => {
                let compensation = self
                    .run_compensation(&request.step_id, &request.compensation_context)
                    .await;
                ResilienceOutcome::Failed {
                    kind,
                    error,
                    attempts,
                    compensation,
                }
            }
        }
    }

    /// Map a failed delegated execution onto the same decision table used for
    /// local failures.
    pub fn handle_boundary_failure(
        &self,
        event: &SubProcessFailed,
        context: &BoundaryFailureContext,
    ) -> BoundaryDecision {
        let kind = self
            .classifier
            .classify_boundary(&event.error_code, &event.message);
        self.record_failure(
            &event.correlation_id.to_string(),
            kind,
            context.redelivery_count + 1,
            &event.message,
        );

        let decision = if context.redelivery_count < context.max_redeliveries
            && kind.is_retryable(context.redelivery_count)
        {
            self.stats.lock().retries += 1;
            BoundaryDecision::Retry {
                delay: context
                    .policy
                    .delay_for_attempt(context.redelivery_count + 1),
            }
        } else {
            match context.error_strategy {
                ErrorStrategy::Fallback => match &event.partial_result {
                    Some(partial) => BoundaryDecision::FallbackWithPartial {
                        partial: partial.clone(),
                    },
                    None => BoundaryDecision::FallbackWithDegraded {
                        value: self.fallback_for(&context.fallback_key),
                    },
                },
                ErrorStrategy::Compensate => BoundaryDecision::Compensate,
                ErrorStrategy::Skip => BoundaryDecision::Skip,
                ErrorStrategy::FailFast => BoundaryDecision::Fail { kind },
            }
        };

        info!(
            correlation_id = %event.correlation_id,
            error_code = %event.error_code,
            failure_kind = %kind,
            redelivery_count = context.redelivery_count,
            decision = ?decision,
            "Boundary failure handled"
        );
        decision
    }

    /// Value substituted by the FALLBACK strategy for `key`
    pub fn register_fallback(&self, key: impl Into<String>, value: Value) {
        self.fallbacks.insert(key.into(), value);
    }

    fn fallback_for(&self, key: &str) -> Value {
        self.fallbacks
            .get(key)
            .map(|value| value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn register_compensation(&self, step_id: impl Into<String>, action: Arc<dyn CompensationAction>) {
        self.compensations.register(step_id, action);
    }

    /// Run the compensation registered for `step_id`, if any. Best effort.
    pub async fn run_compensation(
        &self,
        step_id: &str,
        context: &Value,
    ) -> Option<CompensationRecord> {
        let record = self.compensations.run(step_id, context).await?;
        let mut stats = self.stats.lock();
        stats.compensations_run += 1;
        if !record.success {
            stats.compensations_failed += 1;
        }
        Some(record)
    }

    pub fn compensation_log(&self) -> Vec<CompensationRecord> {
        self.compensations.log()
    }

    fn record_failure(&self, step_id: &str, kind: FailureKind, attempt: u32, message: &str) {
        self.failure_log.lock().push(FailureRecord {
            timestamp: Utc::now(),
            kind,
            step_id: step_id.to_string(),
            attempt,
            message: message.to_string(),
        });

        let mut stats = self.stats.lock();
        stats.failures += 1;
        *stats.failures_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn failure_log(&self) -> Vec<FailureRecord> {
        self.failure_log.lock().clone()
    }

    pub fn failures_for(&self, step_id: &str) -> Vec<FailureRecord> {
        self.failure_log
            .lock()
            .iter()
            .filter(|record| record.step_id == step_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ResilienceStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerSettings;
    use crate::resilience::RetryStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn manager() -> ResilienceManager {
        ResilienceManager::new(Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerSettings::default(),
        )))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            exponential_base: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn request(strategy: ErrorStrategy, max_attempts: u32) -> ResilienceRequest {
        ResilienceRequest::new("nlp.extract", "nlp")
            .with_policy(fast_policy(max_attempts))
            .with_error_strategy(strategy)
    }

    #[tokio::test]
    async fn test_technical_failures_are_retried_until_success() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let outcome = manager
            .execute_with_resilience(&request(ErrorStrategy::FailFast, 3), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AdapterError::Technical("timeout".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(outcome, ResilienceOutcome::Success { value: 3, attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = manager.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failures_by_kind.get(&FailureKind::Technical), Some(&2));
        assert_eq!(manager.failures_for("nlp.extract").len(), 2);
    }

    #[tokio::test]
    async fn test_business_logic_failure_attempted_once() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let outcome: ResilienceOutcome<()> = manager
            .execute_with_resilience(&request(ErrorStrategy::FailFast, 10), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::BusinessLogic("no revenue table".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome,
            ResilienceOutcome::Failed {
                kind: FailureKind::BusinessLogic,
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_validation_retried_at_most_once() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let outcome: ResilienceOutcome<()> = manager
            .execute_with_resilience(&request(ErrorStrategy::Skip, 5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::Validation("missing field".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            outcome,
            ResilienceOutcome::Skipped {
                kind: FailureKind::Validation,
                attempts: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_consumes_no_attempt() {
        let manager = manager();
        manager.breakers().force_open("nlp");
        let calls = AtomicU32::new(0);

        let outcome: ResilienceOutcome<()> = manager
            .execute_with_resilience(&request(ErrorStrategy::FailFast, 3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(
            outcome,
            ResilienceOutcome::CircuitOpen {
                breaker_key: "nlp".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats().circuit_rejections, 1);
        assert_eq!(manager.stats().attempts, 0);
    }

    #[tokio::test]
    async fn test_fallback_strategy_uses_registered_value() {
        let manager = manager();
        manager.register_fallback("nlp", serde_json::json!({"entities": []}));

        let outcome: ResilienceOutcome<()> = manager
            .execute_with_resilience(&request(ErrorStrategy::Fallback, 2), |_| async {
                Err(AdapterError::Resource("quota".into()))
            })
            .await;

        match outcome {
            ResilienceOutcome::Degraded {
                fallback, attempts, ..
            } => {
                assert_eq!(fallback, serde_json::json!({"entities": []}));
                assert_eq!(attempts, 2);
            }
            other => panic!("expected degraded outcome, got {other:?}"),
        }
    }

    struct Undo(AtomicU32);

    #[async_trait]
    impl CompensationAction for Undo {
        async fn compensate(&self, _step_id: &str, _context: &Value) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_compensate_strategy_runs_action() {
        let manager = manager();
        let undo = Arc::new(Undo(AtomicU32::new(0)));
        manager.register_compensation("nlp.extract", undo.clone());

        let outcome: ResilienceOutcome<()> = manager
            .execute_with_resilience(&request(ErrorStrategy::Compensate, 1), |_| async {
                Err(AdapterError::Technical("boom".into()))
            })
            .await;

        match outcome {
            ResilienceOutcome::Failed { compensation, .. } => {
                assert!(compensation.is_some_and(|record| record.success));
            }
            other => panic!("expected failed outcome, got {other:?}"),
        }
        assert_eq!(undo.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().compensations_run, 1);
    }

    fn boundary_failure(code: &str, partial: Option<Value>) -> SubProcessFailed {
        SubProcessFailed {
            correlation_id: Uuid::new_v4(),
            workflow_id: "wf-1".to_string(),
            error_code: code.to_string(),
            message: "delegated run failed".to_string(),
            partial_result: partial,
            redelivery: 0,
            timestamp: Utc::now(),
        }
    }

    fn boundary_context(strategy: ErrorStrategy, redelivery_count: u32) -> BoundaryFailureContext {
        BoundaryFailureContext {
            error_strategy: strategy,
            redelivery_count,
            max_redeliveries: 2,
            policy: fast_policy(3),
            fallback_key: "wf-1".to_string(),
        }
    }

    #[test]
    fn test_boundary_decision_table() {
        let manager = manager();

        let decision = manager.handle_boundary_failure(
            &boundary_failure("TECHNICAL_FAILURE", None),
            &boundary_context(ErrorStrategy::FailFast, 0),
        );
        assert!(matches!(decision, BoundaryDecision::Retry { .. }));

        let decision = manager.handle_boundary_failure(
            &boundary_failure("TECHNICAL_FAILURE", None),
            &boundary_context(ErrorStrategy::FailFast, 2),
        );
        assert_eq!(
            decision,
            BoundaryDecision::Fail {
                kind: FailureKind::Technical
            }
        );

        let partial = serde_json::json!({"nlp.extract": {"ok": true}});
        let decision = manager.handle_boundary_failure(
            &boundary_failure("BUSINESS_LOGIC_FAILURE", Some(partial.clone())),
            &boundary_context(ErrorStrategy::Fallback, 0),
        );
        assert_eq!(decision, BoundaryDecision::FallbackWithPartial { partial });

        let decision = manager.handle_boundary_failure(
            &boundary_failure("BUSINESS_LOGIC_FAILURE", None),
            &boundary_context(ErrorStrategy::Fallback, 0),
        );
        assert_eq!(
            decision,
            BoundaryDecision::FallbackWithDegraded { value: Value::Null }
        );

        let decision = manager.handle_boundary_failure(
            &boundary_failure("BUSINESS_LOGIC_FAILURE", None),
            &boundary_context(ErrorStrategy::Compensate, 0),
        );
        assert_eq!(decision, BoundaryDecision::Compensate);

        let decision = manager.handle_boundary_failure(
            &boundary_failure("VALIDATION_FAILURE", None),
            &boundary_context(ErrorStrategy::Skip, 1),
        );
        assert_eq!(decision, BoundaryDecision::Skip);
    }
}
