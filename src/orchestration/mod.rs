//! # Orchestration Engine
//!
//! Dependency-ordered execution of item chains on top of the resilience,
//! registry and state layers.
//!
//! ## Core Components
//!
//! - **DependencyGraph**: adapter DAG validated once at start, with deterministic waves
//! - **ModuleController**: the single invocation boundary to adapters
//! - **DependencyScheduler**: plans chain waves and runs them with bounded concurrency
//! - **WorkflowOrchestrator**: drives a batch of items and folds outcomes into state
//! - **WavefrontEngine**: bootstrap that wires the components from configuration
//!
//! ## Control flow
//!
//! ```text
//! WorkflowOrchestrator::execute_workflow
//!   -> StateStore::create
//!   -> per item: dependency check
//!        -> DependencyScheduler::execute_chain
//!             -> per step: ModuleController::invoke
//!                  -> ResilienceManager::execute_with_resilience -> adapter
//!        -> StateStore::record_step_result
//!   -> WorkflowResult
//! ```

pub mod bootstrap;
pub mod dag;
pub mod module_controller;
pub mod orchestrator;
pub mod scheduler;
pub mod types;

pub use bootstrap::{EngineCollaborators, SystemStatus, WavefrontEngine};
pub use dag::{DependencyGraph, DependencyNode};
pub use module_controller::{
    AdapterPerformance, InvocationRequest, InvocationResult, ModuleController,
};
pub use orchestrator::WorkflowOrchestrator;
pub use scheduler::{
    ChainContext, ChainExecution, DependencyScheduler, DispatchGate, StepExecution,
    CIRCUIT_OPEN_MESSAGE,
};
pub use types::WorkflowResult;
