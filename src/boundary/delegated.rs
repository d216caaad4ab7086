//! # Delegated Executor
//!
//! Executing side of the boundary protocol. Consumes `SubProcessInitiated`,
//! runs each requested item's chain through the [`DependencyScheduler`] and
//! answers with exactly one `Completed` or `Failed` message echoing the
//! request's correlation id. A failure carries the outputs of every step
//! that succeeded as its partial result.
//!
//! Redeliveries are executed again in full; chains are expected to tolerate
//! at-least-once execution.

use crate::boundary::{BoundaryMessage, SubProcessCompleted, SubProcessFailed, SubProcessInitiated};
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus, EventType};
use crate::orchestration::{ChainContext, DependencyScheduler};
use crate::registry::ContextProvider;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SUBSCRIBER_ID: &str = "delegated-executor";

pub struct DelegatedExecutor {
    scheduler: Arc<DependencyScheduler>,
    contexts: Arc<dyn ContextProvider>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for DelegatedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedExecutor")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[derive(Default)]
struct RunSummary {
    output: Map<String, Value>,
    partial: Map<String, Value>,
    steps_succeeded: u32,
    steps_failed: u32,
    first_error_code: Option<String>,
    errors: Vec<String>,
}

impl DelegatedExecutor {
    pub fn new(
        scheduler: Arc<DependencyScheduler>,
        contexts: Arc<dyn ContextProvider>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            scheduler,
            contexts,
            events,
        }
    }

    /// Execute one request and publish its terminal message
    pub async fn handle_initiated(&self, message: &SubProcessInitiated) -> BoundaryMessage {
        let started = Instant::now();
        let timeout = Duration::from_millis(message.timeout_ms.max(1));

        let response = match tokio::time::timeout(timeout, self.run_items(message)).await {
            Ok(summary) => finish(message, summary, started),
            Err(_) => {
                warn!(
                    correlation_id = %message.correlation_id,
                    timeout_ms = message.timeout_ms,
                    "Delegated execution timed out"
                );
                BoundaryMessage::Failed(SubProcessFailed {
                    correlation_id: message.correlation_id,
                    workflow_id: message.workflow_id.clone(),
                    error_code: "TIMEOUT".to_string(),
                    message: format!("execution exceeded {} ms", message.timeout_ms),
                    partial_result: None,
                    redelivery: message.redelivery,
                    timestamp: Utc::now(),
                })
            }
        };

        self.events
            .publish(EngineEvent::from_boundary_message(response.clone()));
        response
    }

    async fn run_items(&self, message: &SubProcessInitiated) -> RunSummary {
        let mut summary = RunSummary::default();

        for item_id in &message.item_ids {
            let context = match self.contexts.get_context(item_id).await {
                Ok(context) => context,
                Err(e) => {
                    summary.record_error("CONFIGURATION_ERROR", format!("{item_id}: {e}"));
                    continue;
                }
            };

            let chain_context =
                ChainContext::new(message.workflow_id.as_str(), context.clone(), message.input.clone())
                    .with_correlation_id(message.correlation_id);
            let chain = match self
                .scheduler
                .run_chain(&context.execution_chain, &chain_context)
                .await
            {
                Ok(chain) => chain,
                Err(e) => {
                    summary.record_error("CONFIGURATION_ERROR", format!("{item_id}: {e}"));
                    continue;
                }
            };

            summary.steps_succeeded += chain.completed.len() as u32;
            summary.steps_failed += chain.failed.len() as u32;
            let outputs = chain.outputs();
            if !outputs.is_empty() {
                summary
                    .partial
                    .insert(item_id.clone(), Value::Object(outputs.clone()));
            }
            summary.output.insert(item_id.clone(), Value::Object(outputs));

            for step_id in &chain.failed {
                if let Some(step) = chain.results.get(step_id) {
                    let code = step
                        .failure_kind
                        .map(|kind| kind.error_code().to_string())
                        .unwrap_or_else(|| "STEP_FAILURE".to_string());
                    summary.record_error(
                        &code,
                        format!(
                            "{item_id}/{}: {}",
                            step.step_id,
                            step.error.as_deref().unwrap_or("failed")
                        ),
                    );
                }
            }
        }
        summary
    }

    /// Subscribe to `SubProcessInitiated` and run each request on its own task
    pub fn start(self: &Arc<Self>) -> EngineResult<JoinHandle<()>> {
        let mut receiver =
            self.events
                .subscribe(SUBSCRIBER_ID, vec![EventType::SubprocessInitiated], None)?;
        let executor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Some(BoundaryMessage::Initiated(message)) = event.boundary_message() {
                    let executor = Arc::clone(&executor);
                    tokio::spawn(async move {
                        executor.handle_initiated(&message).await;
                    });
                }
            }
            debug!("Delegated executor stopped");
        }))
    }

    pub fn stop(&self) -> bool {
        self.events.unsubscribe(SUBSCRIBER_ID)
    }
}

impl RunSummary {
    fn record_error(&mut self, code: &str, message: String) {
        if self.first_error_code.is_none() {
            self.first_error_code = Some(code.to_string());
        }
        self.errors.push(message);
    }
}

fn finish(message: &SubProcessInitiated, summary: RunSummary, started: Instant) -> BoundaryMessage {
    let execution_time_ms = started.elapsed().as_millis() as u64;

    match summary.first_error_code {
        None => {
            info!(
                correlation_id = %message.correlation_id,
                workflow_id = %message.workflow_id,
                steps = summary.steps_succeeded,
                redelivery = message.redelivery,
                "Delegated execution completed"
            );
            BoundaryMessage::Completed(SubProcessCompleted {
                correlation_id: message.correlation_id,
                workflow_id: message.workflow_id.clone(),
                output: Value::Object(summary.output),
                steps_executed: summary.steps_succeeded + summary.steps_failed,
                steps_succeeded: summary.steps_succeeded,
                steps_failed: summary.steps_failed,
                execution_time_ms,
                timestamp: Utc::now(),
            })
        }
        Some(error_code) => {
            warn!(
                correlation_id = %message.correlation_id,
                workflow_id = %message.workflow_id,
                error_code = %error_code,
                failed_steps = summary.steps_failed,
                "Delegated execution failed"
            );
            BoundaryMessage::Failed(SubProcessFailed {
                correlation_id: message.correlation_id,
                workflow_id: message.workflow_id.clone(),
                error_code,
                message: summary.errors.join("; "),
                partial_result: (!summary.partial.is_empty())
                    .then(|| Value::Object(summary.partial)),
                redelivery: message.redelivery,
                timestamp: Utc::now(),
            })
        }
    }
}
