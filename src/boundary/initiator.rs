//! # Boundary Initiator
//!
//! Requesting side of the delegated execution protocol.
//!
//! `initiate` assigns the correlation id, indexes the request as pending and
//! publishes `SubProcessInitiated`. Terminal messages arriving on the bus are
//! matched by correlation id:
//!
//! - `Completed` resolves and removes the pending entry.
//! - `Failed` goes through the resilience decision table. A retry decision
//!   republishes `Initiated` with the same correlation id after the computed
//!   delay and keeps the entry; every other decision resolves and removes it.
//!
//! Delivery is at-least-once, so messages for unknown or already resolved
//! correlation ids are ignored. A `Failed` is acted on only when its
//! `redelivery` matches the pending entry's current delivery.

use crate::boundary::{
    BoundaryMessage, SubProcessCompleted, SubProcessFailed, SubProcessInitiated,
    SubProcessRequest, SubProcessResponse,
};
use crate::config::BoundaryConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, EventType};
use crate::resilience::{BoundaryDecision, BoundaryFailureContext, ResilienceManager, RetryPolicy};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SUBSCRIBER_ID: &str = "boundary-initiator";

struct PendingRequest {
    request: SubProcessRequest,
    redelivery: u32,
    initiated_at: DateTime<Utc>,
    waiter: Option<oneshot::Sender<SubProcessResponse>>,
}

enum FailureAction {
    Redeliver {
        message: SubProcessInitiated,
        delay: Duration,
    },
    Resolve {
        decision: BoundaryDecision,
        pending: PendingRequest,
    },
}

/// Read-only view of a pending request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub correlation_id: Uuid,
    pub workflow_id: String,
    pub item_ids: Vec<String>,
    pub redelivery: u32,
    pub initiated_at: DateTime<Utc>,
}

/// What handling one terminal message led to
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryResolution {
    Completed(SubProcessResponse),

    /// Request re-sent with the same correlation id
    Redelivered { redelivery: u32, delay: Duration },

    /// Failure resolved through the decision table
    Resolved {
        decision: BoundaryDecision,
        response: SubProcessResponse,
    },
}

pub struct BoundaryInitiator {
    events: Arc<EventBus>,
    resilience: Arc<ResilienceManager>,
    config: BoundaryConfig,
    policy: RetryPolicy,
    pending: DashMap<Uuid, PendingRequest>,
}

impl std::fmt::Debug for BoundaryInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryInitiator")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl BoundaryInitiator {
    pub fn new(
        events: Arc<EventBus>,
        resilience: Arc<ResilienceManager>,
        config: BoundaryConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            events,
            resilience,
            config,
            policy,
            pending: DashMap::new(),
        }
    }

    /// Request with the configured default timeout
    pub fn new_request(
        &self,
        workflow_id: impl Into<String>,
        item_ids: Vec<String>,
        input: Value,
    ) -> SubProcessRequest {
        SubProcessRequest::new(workflow_id, item_ids, input)
            .with_timeout(self.config.default_timeout())
    }

    /// Publish a new request and return its correlation id
    pub fn initiate(&self, request: SubProcessRequest) -> Uuid {
        self.register(request, None)
    }

    /// Publish a request and wait for its resolution or timeout
    pub async fn initiate_and_wait(
        &self,
        request: SubProcessRequest,
    ) -> EngineResult<SubProcessResponse> {
        let timeout = request.timeout;
        let (sender, receiver) = oneshot::channel();
        let correlation_id = self.register(request, Some(sender));

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.remove(&correlation_id);
                Err(EngineError::Boundary(format!(
                    "request {correlation_id} was dropped before resolution"
                )))
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Delegated request timed out"
                );
                Err(EngineError::Boundary(format!(
                    "request {correlation_id} timed out after {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    fn register(
        &self,
        request: SubProcessRequest,
        waiter: Option<oneshot::Sender<SubProcessResponse>>,
    ) -> Uuid {
        let correlation_id = Uuid::new_v4();
        let message = initiated_message(correlation_id, &request, 0);
        self.pending.insert(
            correlation_id,
            PendingRequest {
                request,
                redelivery: 0,
                initiated_at: Utc::now(),
                waiter,
            },
        );

        info!(
            correlation_id = %correlation_id,
            workflow_id = %message.workflow_id,
            items = message.item_ids.len(),
            "Delegated request initiated"
        );
        self.events.publish(EngineEvent::subprocess_initiated(message));
        correlation_id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, correlation_id: &Uuid) -> Option<PendingSnapshot> {
        self.pending.get(correlation_id).map(|entry| PendingSnapshot {
            correlation_id: *correlation_id,
            workflow_id: entry.request.workflow_id.clone(),
            item_ids: entry.request.item_ids.clone(),
            redelivery: entry.redelivery,
            initiated_at: entry.initiated_at,
        })
    }

    /// Handle one protocol message. Returns `None` when it was ignored.
    pub async fn handle_message(&self, message: BoundaryMessage) -> Option<BoundaryResolution> {
        match message {
            BoundaryMessage::Initiated(_) => None,
            BoundaryMessage::Completed(completed) => self.handle_completed(completed),
            BoundaryMessage::Failed(failed) => self.handle_failed(failed).await,
        }
    }

    fn handle_completed(&self, completed: SubProcessCompleted) -> Option<BoundaryResolution> {
        let Some((_, pending)) = self.pending.remove(&completed.correlation_id) else {
            debug!(
                correlation_id = %completed.correlation_id,
                "Ignoring completion for unknown correlation id"
            );
            return None;
        };

        let response = SubProcessResponse::from(&completed);
        info!(
            correlation_id = %completed.correlation_id,
            workflow_id = %completed.workflow_id,
            steps_executed = completed.steps_executed,
            redeliveries = pending.redelivery,
            "Delegated request completed"
        );
        resolve_waiter(pending, response.clone());
        Some(BoundaryResolution::Completed(response))
    }

    async fn handle_failed(&self, failed: SubProcessFailed) -> Option<BoundaryResolution> {
        // Decision and redelivery bump happen under the entry lock so that
        // duplicate failures for one delivery act once
        let action = match self.pending.entry(failed.correlation_id) {
            Entry::Vacant(_) => {
                debug!(
                    correlation_id = %failed.correlation_id,
                    "Ignoring failure for unknown correlation id"
                );
                return None;
            }
            Entry::Occupied(mut entry) => {
                let current = entry.get().redelivery;
                if failed.redelivery != current {
                    debug!(
                        correlation_id = %failed.correlation_id,
                        failed_redelivery = failed.redelivery,
                        current_redelivery = current,
                        "Ignoring failure for a superseded delivery"
                    );
                    return None;
                }

                let context = BoundaryFailureContext {
                    error_strategy: entry.get().request.error_strategy,
                    redelivery_count: current,
                    max_redeliveries: self.config.max_redeliveries,
                    policy: self.policy.clone(),
                    fallback_key: entry.get().request.workflow_id.clone(),
                };
                match self.resilience.handle_boundary_failure(&failed, &context) {
                    BoundaryDecision::Retry { delay } => {
                        let pending = entry.get_mut();
                        pending.redelivery += 1;
                        FailureAction::Redeliver {
                            message: initiated_message(
                                failed.correlation_id,
                                &pending.request,
                                pending.redelivery,
                            ),
                            delay,
                        }
                    }
                    decision => FailureAction::Resolve {
                        decision,
                        pending: entry.remove(),
                    },
                }
            }
        };

        let (decision, pending) = match action {
            FailureAction::Redeliver { message, delay } => {
                return Some(self.redeliver(message, delay));
            }
            FailureAction::Resolve { decision, pending } => (decision, pending),
        };

        let output = match &decision {
            BoundaryDecision::FallbackWithPartial { partial } => partial.clone(),
            BoundaryDecision::FallbackWithDegraded { value } => value.clone(),
            _ => Value::Null,
        };
        if decision == BoundaryDecision::Compensate {
            self.resilience
                .run_compensation(
                    &pending.request.workflow_id,
                    &json!({
                        "correlation_id": failed.correlation_id,
                        "item_ids": pending.request.item_ids,
                        "partial_result": failed.partial_result,
                    }),
                )
                .await;
        }

        let response = SubProcessResponse {
            correlation_id: failed.correlation_id,
            success: false,
            output,
            steps_executed: 0,
            steps_succeeded: 0,
            steps_failed: 0,
            partial_result: failed.partial_result.clone(),
            error: Some(format!("{}: {}", failed.error_code, failed.message)),
            execution_time_ms: 0,
        };
        resolve_waiter(pending, response.clone());
        Some(BoundaryResolution::Resolved { decision, response })
    }

    fn redeliver(&self, message: SubProcessInitiated, delay: Duration) -> BoundaryResolution {
        let redelivery = message.redelivery;
        info!(
            correlation_id = %message.correlation_id,
            redelivery = redelivery,
            delay_ms = delay.as_millis() as u64,
            "Redelivering delegated request"
        );
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            events.publish(EngineEvent::subprocess_initiated(message));
        });

        BoundaryResolution::Redelivered { redelivery, delay }
    }

    /// Subscribe to terminal boundary events and handle them until [`stop`](Self::stop)
    pub fn start(self: &Arc<Self>) -> EngineResult<JoinHandle<()>> {
        let mut receiver = self.events.subscribe(
            SUBSCRIBER_ID,
            vec![EventType::SubprocessCompleted, EventType::SubprocessFailed],
            None,
        )?;
        let initiator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Some(message) = event.boundary_message() {
                    initiator.handle_message(message).await;
                }
            }
            debug!("Boundary initiator stopped");
        }))
    }

    pub fn stop(&self) -> bool {
        self.events.unsubscribe(SUBSCRIBER_ID)
    }
}

fn initiated_message(
    correlation_id: Uuid,
    request: &SubProcessRequest,
    redelivery: u32,
) -> SubProcessInitiated {
    SubProcessInitiated {
        correlation_id,
        workflow_id: request.workflow_id.clone(),
        item_ids: request.item_ids.clone(),
        input: request.input.clone(),
        timeout_ms: request.timeout.as_millis() as u64,
        redelivery,
        timestamp: Utc::now(),
    }
}

fn resolve_waiter(pending: PendingRequest, response: SubProcessResponse) {
    if let Some(waiter) = pending.waiter {
        // Receiver is gone when the caller already timed out
        let _ = waiter.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerRegistry, ErrorStrategy};

    fn initiator(max_redeliveries: u32) -> (Arc<BoundaryInitiator>, Arc<EventBus>) {
        let events = Arc::new(EventBus::default());
        let resilience = Arc::new(ResilienceManager::new(Arc::new(
            CircuitBreakerRegistry::default(),
        )));
        let initiator = BoundaryInitiator::new(
            Arc::clone(&events),
            resilience,
            BoundaryConfig {
                default_timeout_ms: 500,
                max_redeliveries,
            },
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        );
        (Arc::new(initiator), events)
    }

    fn failed(correlation_id: Uuid, error_code: &str) -> BoundaryMessage {
        failed_delivery(correlation_id, error_code, 0)
    }

    fn failed_delivery(correlation_id: Uuid, error_code: &str, redelivery: u32) -> BoundaryMessage {
        BoundaryMessage::Failed(SubProcessFailed {
            correlation_id,
            workflow_id: "wf-1".to_string(),
            error_code: error_code.to_string(),
            message: "worker lost".to_string(),
            partial_result: Some(json!({"Q1": {"ocr.scan": {}}})),
            redelivery,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_retry_keeps_correlation_id_and_pending_entry() {
        let (initiator, events) = initiator(2);
        let mut initiated = events
            .subscribe("test", vec![EventType::SubprocessInitiated], None)
            .unwrap();

        let request = initiator.new_request("wf-1", vec!["Q1".to_string()], json!({}));
        let correlation_id = initiator.initiate(request);
        let first = initiated.recv().await.unwrap();
        assert_eq!(first.correlation_id, correlation_id);

        let resolution = initiator
            .handle_message(failed(correlation_id, "TECHNICAL_FAILURE"))
            .await;
        assert!(matches!(
            resolution,
            Some(BoundaryResolution::Redelivered { redelivery: 1, .. })
        ));

        let second = initiated.recv().await.unwrap();
        assert_eq!(second.correlation_id, correlation_id);
        match second.boundary_message() {
            Some(BoundaryMessage::Initiated(message)) => assert_eq!(message.redelivery, 1),
            other => panic!("expected redelivery, got {other:?}"),
        }
        assert_eq!(initiator.pending(&correlation_id).unwrap().redelivery, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_resolve_with_partial_fallback() {
        let (initiator, _events) = initiator(0);
        let request = initiator
            .new_request("wf-1", vec!["Q1".to_string()], json!({}))
            .with_error_strategy(ErrorStrategy::Fallback);
        let correlation_id = initiator.initiate(request);

        match initiator
            .handle_message(failed(correlation_id, "TECHNICAL_FAILURE"))
            .await
        {
            Some(BoundaryResolution::Resolved { decision, response }) => {
                assert!(matches!(decision, BoundaryDecision::FallbackWithPartial { .. }));
                assert!(!response.success);
                assert_eq!(response.output["Q1"], json!({"ocr.scan": {}}));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        assert_eq!(initiator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_messages_ignored() {
        let (initiator, _events) = initiator(1);
        let correlation_id =
            initiator.initiate(initiator.new_request("wf-1", vec![], json!({})));

        let completed = BoundaryMessage::Completed(SubProcessCompleted {
            correlation_id,
            workflow_id: "wf-1".to_string(),
            output: json!({}),
            steps_executed: 1,
            steps_succeeded: 1,
            steps_failed: 0,
            execution_time_ms: 3,
            timestamp: Utc::now(),
        });
        assert!(matches!(
            initiator.handle_message(completed.clone()).await,
            Some(BoundaryResolution::Completed(_))
        ));
        assert!(initiator.handle_message(completed).await.is_none());
        assert!(initiator
            .handle_message(failed(Uuid::new_v4(), "TECHNICAL_FAILURE"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_initiate_and_wait_times_out() {
        let (initiator, _events) = initiator(0);
        let request = initiator
            .new_request("wf-1", vec![], json!({}))
            .with_timeout(Duration::from_millis(20));

        let result = initiator.initiate_and_wait(request).await;
        assert!(matches!(result, Err(EngineError::Boundary(_))));
        assert_eq!(initiator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_failure_for_one_delivery_redelivers_once() {
        let (initiator, _events) = initiator(3);
        let correlation_id =
            initiator.initiate(initiator.new_request("wf-1", vec!["Q1".to_string()], json!({})));

        let first = initiator
            .handle_message(failed_delivery(correlation_id, "TECHNICAL_FAILURE", 0))
            .await;
        let duplicate = initiator
            .handle_message(failed_delivery(correlation_id, "TECHNICAL_FAILURE", 0))
            .await;

        assert!(matches!(
            first,
            Some(BoundaryResolution::Redelivered { redelivery: 1, .. })
        ));
        assert!(duplicate.is_none());
        assert_eq!(initiator.pending(&correlation_id).unwrap().redelivery, 1);

        // the answer to the redelivery is still acted on
        let next = initiator
            .handle_message(failed_delivery(correlation_id, "TECHNICAL_FAILURE", 1))
            .await;
        assert!(matches!(
            next,
            Some(BoundaryResolution::Redelivered { redelivery: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_failures_spend_one_retry() {
        let (initiator, _events) = initiator(5);
        let correlation_id =
            initiator.initiate(initiator.new_request("wf-1", vec!["Q1".to_string()], json!({})));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let initiator = Arc::clone(&initiator);
                tokio::spawn(async move {
                    initiator
                        .handle_message(failed_delivery(correlation_id, "TECHNICAL_FAILURE", 0))
                        .await
                })
            })
            .collect();

        let mut acted = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                acted += 1;
            }
        }
        assert_eq!(acted, 1);
        assert_eq!(initiator.pending(&correlation_id).unwrap().redelivery, 1);
    }

    #[tokio::test]
    async fn test_stale_failure_after_redelivery_is_ignored() {
        let (initiator, _events) = initiator(0);
        let request = initiator
            .new_request("wf-1", vec!["Q1".to_string()], json!({}))
            .with_error_strategy(ErrorStrategy::Skip);
        let correlation_id = initiator.initiate(request);

        let ahead = initiator
            .handle_message(failed_delivery(correlation_id, "TECHNICAL_FAILURE", 4))
            .await;
        assert!(ahead.is_none());
        assert_eq!(initiator.pending_count(), 1);
    }
}
