//! Engines bootstrapped from layered configuration files

mod common;

use anyhow::{Context, Result};
use common::*;
use serde_json::json;
use wavefront_core::config::ConfigManager;
use wavefront_core::orchestration::CIRCUIT_OPEN_MESSAGE;
use wavefront_core::registry::{AdapterError, ChainStep, ItemContext};
use wavefront_core::resilience::CircuitState;
use wavefront_core::state::WorkflowStatus;

const ENGINE_TOML: &str = r#"
[retry]
strategy = "none"
max_attempts = 1

[circuit_breakers.adapters.ocr]
failure_threshold = 1.0
cooldown_ms = 60000
"#;

#[tokio::test]
async fn test_adapter_breaker_override_opens_after_one_failure() -> Result<()> {
    let directory = tempfile::tempdir()?;
    std::fs::write(directory.path().join("wavefront.toml"), ENGINE_TOML)?;
    let manager =
        ConfigManager::load_from_directory_with_env(Some(directory.path().to_path_buf()), "test")
            .context("loading engine configuration")?;

    let ocr = ScriptedAdapter::failing("ocr", 1, AdapterError::Technical("scanner offline".into()));
    let engine = engine_with(
        manager.config().clone(),
        &[ocr.clone()],
        vec![("ocr", vec![])],
        vec![
            ItemContext::new("Q1", vec![ChainStep::new("ocr", "run")]),
            ItemContext::new("Q2", vec![ChainStep::new("ocr", "run")]),
        ],
    );

    let result = engine
        .orchestrator()
        .execute_workflow("wf-config", ids(&["Q1", "Q2"]), json!({}))
        .await?;

    assert_eq!(ocr.calls(), 1);
    assert_eq!(result.failed, vec!["Q1"]);
    assert_eq!(result.skipped, vec!["Q2"]);
    assert_eq!(result.status, WorkflowStatus::Failed);
    let skipped = result.step_results["Q2"]
        .error
        .as_deref()
        .context("skipped item carries a reason")?;
    assert!(skipped.contains(CIRCUIT_OPEN_MESSAGE));

    assert_eq!(engine.circuit_breakers().state("ocr"), Some(CircuitState::Open));
    assert_eq!(engine.status().open_circuits, vec!["ocr".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_disabled_breakers_never_skip() -> Result<()> {
    let config = ConfigManager::from_toml_str(
        r#"
        [circuit_breakers]
        enabled = false

        [retry]
        strategy = "none"
        max_attempts = 1
        "#,
    )?;

    let ocr = ScriptedAdapter::broken("ocr", AdapterError::Resource("quota exhausted".into()));
    let engine = engine_with(
        config,
        &[ocr.clone()],
        vec![("ocr", vec![])],
        (1..=8)
            .map(|index| ItemContext::new(format!("Q{index}"), vec![ChainStep::new("ocr", "run")]))
            .collect(),
    );

    let items: Vec<String> = (1..=8).map(|index| format!("Q{index}")).collect();
    let result = engine
        .orchestrator()
        .execute_workflow("wf-no-breakers", items, json!({}))
        .await?;

    assert_eq!(ocr.calls(), 8);
    assert_eq!(result.failed.len(), 8);
    assert!(result.skipped.is_empty());
    assert!(!engine.status().circuit_breakers_enabled);
    Ok(())
}
