#![allow(clippy::doc_markdown)] // Allow technical terms in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Wavefront Core
//!
//! Deterministic, fault-tolerant DAG workflow engine for adapter-driven analysis
//! pipelines.
//!
//! ## Overview
//!
//! Each item of a workload carries a dependency-ordered chain of adapter
//! invocations. The engine executes that chain in topological waves, keeps going
//! when adapters are slow, flaky or temporarily unavailable, and records a
//! versioned, inspectable history of what happened.
//!
//! ## Module Organization
//!
//! - [`state`] - Versioned workflow state, optimistic concurrency and durable sinks
//! - [`orchestration`] - Dependency graph, scheduler, module controller and orchestrator
//! - [`resilience`] - Circuit breakers, retry policies, failure classification, compensation
//! - [`registry`] - Adapter, context provider and validator interfaces
//! - [`events`] - Immutable engine events and the non-blocking event bus
//! - [`boundary`] - Correlation-id protocol for delegated execution
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured tracing setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wavefront_core::config::EngineConfig;
//! use wavefront_core::orchestration::{DependencyGraph, EngineCollaborators, WavefrontEngine};
//! use wavefront_core::registry::{
//!     AcceptAllValidator, ArgumentSource, ChainStep, InMemoryAdapterRegistry, ItemContext,
//!     StaticContextProvider,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! wavefront_core::logging::init_structured_logging();
//!
//! let chain = vec![
//!     ChainStep::new("ocr", "scan").with_arg(ArgumentSource::SourceDocument),
//!     ChainStep::new("nlp", "entities").with_arg(ArgumentSource::step_output("ocr.scan")),
//! ];
//! let collaborators = EngineCollaborators {
//!     registry: Arc::new(InMemoryAdapterRegistry::new()),
//!     contexts: Arc::new(StaticContextProvider::from_contexts(vec![ItemContext::new("Q1", chain)])),
//!     validator: Arc::new(AcceptAllValidator),
//!     graph: DependencyGraph::new(vec![("ocr", vec![]), ("nlp", vec!["ocr"])])?,
//! };
//!
//! let engine = WavefrontEngine::bootstrap(EngineConfig::default(), collaborators)?;
//! let result = engine
//!     .orchestrator()
//!     .execute_workflow("wf-1", vec!["Q1".to_string()], serde_json::json!({"text": "..."}))
//!     .await?;
//! println!("completed={:?} failed={:?}", result.completed, result.failed);
//! # Ok(())
//! # }
//! ```

pub mod boundary;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod state;

pub use config::{ConfigManager, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus, EventType};
pub use orchestration::{
    DependencyGraph, DependencyScheduler, EngineCollaborators, ModuleController, WavefrontEngine,
    WorkflowOrchestrator, WorkflowResult,
};
pub use registry::{Adapter, AdapterError, AdapterRegistry, ContextProvider, OutputValidator};
pub use resilience::{
    CircuitBreakerRegistry, ErrorStrategy, FailureKind, ResilienceManager, RetryPolicy,
};
pub use state::{StateStore, StepResult, StepStatus, WorkflowState, WorkflowStatus};
