//! Initiator and delegated executor exchanging messages over one event bus

mod common;

use chrono::Utc;
use common::*;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;
use wavefront_core::boundary::{BoundaryMessage, SubProcessCompleted};
use wavefront_core::events::EventType;
use wavefront_core::registry::{AdapterError, ArgumentSource, ChainStep, ItemContext};
use wavefront_core::resilience::ErrorStrategy;
use wavefront_core::EngineError;

#[tokio::test]
async fn test_delegated_request_round_trip() {
    init_test_logging();

    let ocr = ScriptedAdapter::succeeding("ocr");
    let nlp = ScriptedAdapter::succeeding("nlp");
    let chain = vec![
        ChainStep::new("ocr", "run").with_arg(ArgumentSource::SourceDocument),
        ChainStep::new("nlp", "run").with_arg(ArgumentSource::step_output("ocr.run")),
    ];
    let engine = engine(
        &[ocr.clone(), nlp.clone()],
        vec![("ocr", vec![]), ("nlp", vec!["ocr"])],
        vec![ItemContext::new("Q1", chain)],
    );

    let executor = engine.delegated_executor();
    let initiator = engine.boundary_initiator();
    executor.start().unwrap();
    initiator.start().unwrap();

    let request = initiator.new_request("wf-delegated", ids(&["Q1"]), json!({"text": "memo"}));
    let response = initiator.initiate_and_wait(request).await.unwrap();

    assert!(response.success);
    assert_eq!(response.steps_executed, 2);
    assert_eq!(response.steps_failed, 0);
    assert_eq!(response.output["Q1"]["nlp.run"]["adapter"], "nlp");
    assert_eq!(initiator.pending_count(), 0);
    assert_eq!(ocr.calls(), 1);
    assert_eq!(nlp.calls(), 1);

    assert!(executor.stop());
    assert!(initiator.stop());
}

#[tokio::test]
async fn test_technical_failure_is_redelivered_with_same_correlation_id() {
    let flaky = ScriptedAdapter::failing("flaky", 3, AdapterError::Technical("socket closed".into()));
    let engine = engine(
        &[flaky.clone()],
        vec![("flaky", vec![])],
        vec![ItemContext::new("Q1", vec![ChainStep::new("flaky", "run")])],
    );

    let executor = engine.delegated_executor();
    let initiator = engine.boundary_initiator();
    executor.start().unwrap();
    initiator.start().unwrap();

    let request = initiator.new_request("wf-redelivery", ids(&["Q1"]), json!({}));
    let response = initiator.initiate_and_wait(request).await.unwrap();

    assert!(response.success);
    // three attempts on the first delivery, one on the redelivery
    assert_eq!(flaky.calls(), 4);

    let initiated: Vec<_> = engine
        .events()
        .recent_events(128)
        .into_iter()
        .filter(|event| event.event_type == EventType::SubprocessInitiated)
        .collect();
    assert_eq!(initiated.len(), 2);
    assert_eq!(initiated[0].correlation_id, response.correlation_id);
    assert_eq!(initiated[1].correlation_id, response.correlation_id);
    match initiated[1].boundary_message() {
        Some(BoundaryMessage::Initiated(message)) => assert_eq!(message.redelivery, 1),
        other => panic!("expected initiated message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_business_failure_falls_back_to_partial_result() {
    let extract = ScriptedAdapter::succeeding("extract");
    let ledger = ScriptedAdapter::broken(
        "ledger",
        AdapterError::BusinessLogic("totals do not balance".into()),
    );
    let chain = vec![
        ChainStep::new("extract", "run"),
        ChainStep::new("ledger", "run").with_arg(ArgumentSource::step_output("extract.run")),
    ];
    let engine = engine(
        &[extract.clone(), ledger.clone()],
        vec![("extract", vec![]), ("ledger", vec!["extract"])],
        vec![ItemContext::new("Q1", chain)],
    );

    let executor = engine.delegated_executor();
    let initiator = engine.boundary_initiator();
    executor.start().unwrap();
    initiator.start().unwrap();

    let request = initiator
        .new_request("wf-fallback", ids(&["Q1"]), json!({}))
        .with_error_strategy(ErrorStrategy::Fallback);
    let response = initiator.initiate_and_wait(request).await.unwrap();

    assert!(!response.success);
    assert_eq!(ledger.calls(), 1);
    assert_eq!(response.output["Q1"]["extract.run"]["adapter"], "extract");
    assert_eq!(response.partial_result, Some(response.output.clone()));
    assert!(response
        .error
        .as_deref()
        .unwrap()
        .starts_with("BUSINESS_LOGIC_FAILURE"));
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let engine = engine(&[], vec![], vec![]);
    let initiator = engine.boundary_initiator();

    let request = initiator
        .new_request("wf-timeout", ids(&["Q1"]), json!({}))
        .with_timeout(Duration::from_millis(20));
    let result = initiator.initiate_and_wait(request).await;

    assert!(matches!(result, Err(EngineError::Boundary(_))));
    assert_eq!(initiator.pending_count(), 0);
}

#[tokio::test]
async fn test_unknown_correlation_id_is_ignored() {
    let engine = engine(&[], vec![], vec![]);
    let initiator = engine.boundary_initiator();

    let stray = BoundaryMessage::Completed(SubProcessCompleted {
        correlation_id: Uuid::new_v4(),
        workflow_id: "wf-unknown".to_string(),
        output: json!({}),
        steps_executed: 0,
        steps_succeeded: 0,
        steps_failed: 0,
        execution_time_ms: 0,
        timestamp: Utc::now(),
    });

    assert!(initiator.handle_message(stray).await.is_none());
}
