//! # Item Context
//!
//! Per-item configuration consulted at dispatch time: upstream item
//! dependencies, the adapter chain to run, the error strategy and validation
//! rules. Produced outside the engine and treated as read-only.

use crate::error::{EngineError, EngineResult};
use crate::registry::Kwargs;
use crate::resilience::{ErrorStrategy, RetryPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a positional argument's value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ArgumentSource {
    Literal { value: Value },

    /// The document the workflow is analysing
    SourceDocument,

    /// Output of an earlier step in the same chain.
    ///
    /// `step` is the `adapter.method` key; `path` is an optional JSON pointer
    /// into that step's `data`.
    StepOutput {
        step: String,
        #[serde(default)]
        path: Option<String>,
    },
}

impl ArgumentSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn step_output(step: impl Into<String>) -> Self {
        Self::StepOutput {
            step: step.into(),
            path: None,
        }
    }
}

/// One adapter invocation inside an item's chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub adapter: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgumentSource>,
    #[serde(default)]
    pub kwargs: Kwargs,

    /// Overrides the engine's default retry policy for this step
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl ChainStep {
    pub fn new(adapter: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            retry_policy: None,
        }
    }

    pub fn with_arg(mut self, arg: ArgumentSource) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Key under which this step's result is reported
    pub fn step_id(&self) -> String {
        format!("{}.{}", self.adapter, self.method)
    }

    /// Steps this one reads output from
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|arg| match arg {
            ArgumentSource::StepOutput { step, .. } => Some(step.as_str()),
            _ => None,
        })
    }
}

/// Dispatch-time configuration for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemContext {
    pub item_id: String,

    /// Items that must be completed before this one runs
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub execution_chain: Vec<ChainStep>,

    #[serde(default)]
    pub error_strategy: ErrorStrategy,

    /// Opaque rules handed to the output validator
    #[serde(default)]
    pub validation_rules: Value,

    #[serde(default)]
    pub version: String,
}

impl ItemContext {
    pub fn new(item_id: impl Into<String>, execution_chain: Vec<ChainStep>) -> Self {
        Self {
            item_id: item_id.into(),
            dependencies: Vec::new(),
            execution_chain,
            error_strategy: ErrorStrategy::default(),
            validation_rules: Value::Null,
            version: "1.0".to_string(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    pub fn with_validation_rules(mut self, rules: Value) -> Self {
        self.validation_rules = rules;
        self
    }
}

/// Source of item contexts
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn get_context(&self, item_id: &str) -> EngineResult<ItemContext>;
}

/// Provider over a fixed set of contexts
#[derive(Debug, Default)]
pub struct StaticContextProvider {
    contexts: DashMap<String, ItemContext>,
}

impl StaticContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contexts(contexts: impl IntoIterator<Item = ItemContext>) -> Self {
        let provider = Self::new();
        for context in contexts {
            provider.insert(context);
        }
        provider
    }

    pub fn insert(&self, context: ItemContext) {
        self.contexts.insert(context.item_id.clone(), context);
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    async fn get_context(&self, item_id: &str) -> EngineResult<ItemContext> {
        self.contexts
            .get(item_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::configuration(format!("no context for item '{item_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_step_deserializes_from_document() {
        let step: ChainStep = serde_json::from_value(json!({
            "adapter": "financial",
            "method": "ratios",
            "args": [
                {"source": "source_document"},
                {"source": "step_output", "step": "ocr.scan", "path": "/tables"},
                {"source": "literal", "value": 2}
            ],
            "kwargs": {"currency": "EUR"}
        }))
        .unwrap();

        assert_eq!(step.step_id(), "financial.ratios");
        assert_eq!(step.args[0], ArgumentSource::SourceDocument);
        assert_eq!(step.references().collect::<Vec<_>>(), vec!["ocr.scan"]);
        assert_eq!(step.kwargs.get("currency"), Some(&json!("EUR")));
    }

    #[tokio::test]
    async fn test_static_provider_lookup() {
        let provider = StaticContextProvider::from_contexts([ItemContext::new(
            "Q1",
            vec![ChainStep::new("ocr", "scan")],
        )
        .with_error_strategy(ErrorStrategy::Skip)]);

        let context = provider.get_context("Q1").await.unwrap();
        assert_eq!(context.error_strategy, ErrorStrategy::Skip);
        assert!(matches!(
            provider.get_context("Q9").await,
            Err(EngineError::Configuration(_))
        ));
    }
}
