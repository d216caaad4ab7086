//! # Adapters
//!
//! Adapters are the pluggable units of analysis work. The engine only sees
//! them through [`AdapterRegistry`]: call a method, list methods for
//! pre-flight checks, enumerate adapters.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Keyword arguments passed to adapter methods
pub type Kwargs = Map<String, Value>;

/// Failure raised by an adapter call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("Technical failure: {0}")]
    Technical(String),

    #[error("Resource failure: {0}")]
    Resource(String),

    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Business logic failure: {0}")]
    BusinessLogic(String),

    #[error("Method {adapter}.{method} not found")]
    MethodNotFound { adapter: String, method: String },

    /// Free-form failure; classified by message heuristics
    #[error("{0}")]
    Unclassified(String),
}

/// Outcome status of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    #[default]
    Success,
    Failure,
    Degraded,
    Skipped,
    CircuitOpen,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::CircuitOpen => write!(f, "CIRCUIT_OPEN"),
        }
    }
}

impl InvocationStatus {
    fn parse_loose(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "SUCCESS" | "OK" | "COMPLETED" => Some(Self::Success),
            "FAILURE" | "FAILED" | "ERROR" => Some(Self::Failure),
            "DEGRADED" | "PARTIAL" => Some(Self::Degraded),
            "SKIPPED" => Some(Self::Skipped),
            "CIRCUIT_OPEN" => Some(Self::CircuitOpen),
            _ => None,
        }
    }
}

/// Canonical adapter result shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterResult {
    pub status: InvocationStatus,
    pub data: Value,
    #[serde(default)]
    pub evidence: Vec<Value>,
    pub confidence: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AdapterResult {
    pub fn success(data: Value) -> Self {
        Self {
            status: InvocationStatus::Success,
            data,
            evidence: Vec::new(),
            confidence: 1.0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<Value>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// What an adapter hands back: either the canonical shape or an untyped value
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    Structured(AdapterResult),
    Raw(Value),
}

impl AdapterOutput {
    /// Translate either variant into the canonical [`AdapterResult`].
    ///
    /// Raw maps contribute the recognised canonical keys. `status` and
    /// `confidence` are consumed only when they parse; otherwise they stay
    /// domain fields. Every key that is not consumed ends up in `data`,
    /// merged into an explicit `data` object when one is given. Scalars and
    /// arrays become `data` unchanged.
    pub fn into_result(self) -> AdapterResult {
        match self {
            AdapterOutput::Structured(result) => result,
            AdapterOutput::Raw(Value::Object(mut map)) => {
                let status = match map
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(InvocationStatus::parse_loose)
                {
                    Some(status) => {
                        map.remove("status");
                        status
                    }
                    None => InvocationStatus::Success,
                };
                let confidence = match map.get("confidence").and_then(Value::as_f64) {
                    Some(confidence) => {
                        map.remove("confidence");
                        confidence
                    }
                    None => 1.0,
                };
                let evidence = match map.remove("evidence") {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                let errors = string_list(map.remove("errors"));
                let warnings = string_list(map.remove("warnings"));
                let data = match map.remove("data") {
                    None => Value::Object(map),
                    Some(data) if map.is_empty() => data,
                    Some(Value::Object(mut data)) => {
                        for (key, value) in map {
                            data.entry(key).or_insert(value);
                        }
                        Value::Object(data)
                    }
                    Some(data) => {
                        map.insert("data".to_string(), data);
                        Value::Object(map)
                    }
                };

                AdapterResult {
                    status,
                    data,
                    evidence,
                    confidence,
                    errors,
                    warnings,
                }
            }
            AdapterOutput::Raw(value) => AdapterResult::success(value),
        }
    }
}

fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(text)) => vec![text],
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.to_string()],
    }
}

/// A single pluggable adapter
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn methods(&self) -> Vec<String>;

    async fn call(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<AdapterOutput, AdapterError>;
}

/// Registry through which every adapter call is made
#[async_trait]
pub trait AdapterRegistry: Send + Sync {
    async fn call(
        &self,
        adapter: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<AdapterOutput, AdapterError>;

    /// Methods exposed by `adapter`; empty when the adapter is unknown
    fn list_methods(&self, adapter: &str) -> Vec<String>;

    fn available_adapters(&self) -> Vec<String>;

    fn method_exists(&self, adapter: &str, method: &str) -> bool {
        self.list_methods(adapter).iter().any(|known| known == method)
    }
}

/// Registry backed by adapters registered at process start
#[derive(Default)]
pub struct InMemoryAdapterRegistry {
    adapters: DashMap<String, Arc<dyn Adapter>>,
}

impl fmt::Debug for InMemoryAdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAdapterRegistry")
            .field("adapters", &self.available_adapters())
            .finish()
    }
}

impl InMemoryAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        tracing::debug!(adapter = adapter.name(), "Registered adapter");
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[async_trait]
impl AdapterRegistry for InMemoryAdapterRegistry {
    async fn call(
        &self,
        adapter: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<AdapterOutput, AdapterError> {
        let target = self
            .adapters
            .get(adapter)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AdapterError::MethodNotFound {
                adapter: adapter.to_string(),
                method: method.to_string(),
            })?;

        if !target.methods().iter().any(|known| known == method) {
            return Err(AdapterError::MethodNotFound {
                adapter: adapter.to_string(),
                method: method.to_string(),
            });
        }

        target.call(method, &args, &kwargs).await
    }

    fn list_methods(&self, adapter: &str) -> Vec<String> {
        self.adapters
            .get(adapter)
            .map(|entry| entry.methods())
            .unwrap_or_default()
    }

    fn available_adapters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
