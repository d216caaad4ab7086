//! # Engine Bootstrap
//!
//! Wires every engine component from an [`EngineConfig`] plus the external
//! collaborators (adapter registry, context provider, validator, dependency
//! graph). Shared components are constructed once here and handed out by
//! reference; nothing in the engine is a process-wide global.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wavefront_core::config::EngineConfig;
//! use wavefront_core::orchestration::{DependencyGraph, EngineCollaborators, WavefrontEngine};
//! use wavefront_core::registry::{
//!     AcceptAllValidator, ChainStep, InMemoryAdapterRegistry, ItemContext, StaticContextProvider,
//! };
//!
//! # tokio_test::block_on(async {
//! let collaborators = EngineCollaborators {
//!     registry: Arc::new(InMemoryAdapterRegistry::new()),
//!     contexts: Arc::new(StaticContextProvider::from_contexts(vec![ItemContext::new(
//!         "Q1",
//!         vec![ChainStep::new("ocr", "scan")],
//!     )])),
//!     validator: Arc::new(AcceptAllValidator),
//!     graph: DependencyGraph::new(vec![("ocr", Vec::<String>::new())]).unwrap(),
//! };
//! let engine = WavefrontEngine::bootstrap(EngineConfig::default(), collaborators).unwrap();
//! let result = engine
//!     .orchestrator()
//!     .execute_workflow("wf-1", vec!["Q1".to_string()], serde_json::json!({}))
//!     .await
//!     .unwrap();
//! println!("{:?}", result.status);
//! # });
//! ```

use crate::boundary::{BoundaryInitiator, DelegatedExecutor};
use crate::config::{ConfigManager, EngineConfig};
use crate::error::EngineResult;
use crate::events::EventBus;
use crate::logging::get_environment;
use crate::orchestration::dag::DependencyGraph;
use crate::orchestration::module_controller::ModuleController;
use crate::orchestration::orchestrator::WorkflowOrchestrator;
use crate::orchestration::scheduler::DependencyScheduler;
use crate::registry::{AdapterRegistry, ContextProvider, OutputValidator};
use crate::resilience::{CircuitBreakerRegistry, ResilienceManager};
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// External collaborators supplied by the host application
pub struct EngineCollaborators {
    pub registry: Arc<dyn AdapterRegistry>,
    pub contexts: Arc<dyn ContextProvider>,
    pub validator: Arc<dyn OutputValidator>,
    pub graph: DependencyGraph,
}

/// Point-in-time engine summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub environment: String,
    pub circuit_breakers_enabled: bool,
    pub resilience_enabled: bool,
    pub adapters: usize,
    pub live_workflows: usize,
    pub open_circuits: Vec<String>,
    pub event_subscribers: usize,
    pub max_concurrency: usize,
}

/// Fully wired engine
pub struct WavefrontEngine {
    config: EngineConfig,
    events: Arc<EventBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    resilience: Arc<ResilienceManager>,
    controller: Arc<ModuleController>,
    scheduler: Arc<DependencyScheduler>,
    store: Arc<StateStore>,
    contexts: Arc<dyn ContextProvider>,
    orchestrator: Arc<WorkflowOrchestrator>,
}

impl std::fmt::Debug for WavefrontEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavefrontEngine")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl WavefrontEngine {
    /// Validate `config` and construct every component
    pub fn bootstrap(config: EngineConfig, collaborators: EngineCollaborators) -> EngineResult<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new(&config.events));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breakers.clone()));
        let resilience = Arc::new(ResilienceManager::new(Arc::clone(&breakers)));
        let controller = Arc::new(
            ModuleController::new(
                collaborators.registry,
                Arc::clone(&resilience),
                collaborators.validator,
                config.module_controller.clone(),
            )
            .with_default_policy(config.retry.to_policy()),
        );
        let scheduler = Arc::new(DependencyScheduler::new(
            Arc::new(collaborators.graph),
            Arc::clone(&controller),
            Arc::clone(&breakers),
            Arc::clone(&events),
            config.scheduler.max_concurrency,
        ));
        let store = Arc::new(StateStore::from_config(&config.state_store));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&collaborators.contexts),
            Arc::clone(&events),
        ));

        info!(
            environment = %get_environment(),
            adapters = scheduler.graph().len(),
            circuit_breakers_enabled = breakers.is_enabled(),
            resilience_enabled = controller.resilience_enabled(),
            max_concurrency = config.scheduler.max_concurrency,
            "Engine bootstrapped"
        );

        Ok(Self {
            config,
            events,
            breakers,
            resilience,
            controller,
            scheduler,
            store,
            contexts: collaborators.contexts,
            orchestrator,
        })
    }

    /// Bootstrap from the layered configuration files and environment
    pub fn bootstrap_from_environment(collaborators: EngineCollaborators) -> EngineResult<Self> {
        let manager = ConfigManager::load()?;
        Self::bootstrap(manager.config().clone(), collaborators)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    pub fn module_controller(&self) -> &Arc<ModuleController> {
        &self.controller
    }

    pub fn scheduler(&self) -> &Arc<DependencyScheduler> {
        &self.scheduler
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    /// Requesting side of the delegated protocol, sharing this engine's bus
    pub fn boundary_initiator(&self) -> Arc<BoundaryInitiator> {
        Arc::new(BoundaryInitiator::new(
            Arc::clone(&self.events),
            Arc::clone(&self.resilience),
            self.config.boundary.clone(),
            self.config.retry.to_policy(),
        ))
    }

    /// Executing side of the delegated protocol, sharing this engine's scheduler
    pub fn delegated_executor(&self) -> Arc<DelegatedExecutor> {
        Arc::new(DelegatedExecutor::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.contexts),
            Arc::clone(&self.events),
        ))
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            environment: get_environment(),
            circuit_breakers_enabled: self.breakers.is_enabled(),
            resilience_enabled: self.controller.resilience_enabled(),
            adapters: self.scheduler.graph().len(),
            live_workflows: self.store.list_workflows().len(),
            open_circuits: self.breakers.system_metrics().open_circuits(),
            event_subscribers: self.events.subscriber_count(),
            max_concurrency: self.config.scheduler.max_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::registry::{AcceptAllValidator, InMemoryAdapterRegistry, StaticContextProvider};

    fn collaborators() -> EngineCollaborators {
        EngineCollaborators {
            registry: Arc::new(InMemoryAdapterRegistry::new()),
            contexts: Arc::new(StaticContextProvider::new()),
            validator: Arc::new(AcceptAllValidator),
            graph: DependencyGraph::new(vec![("ocr", vec![]), ("nlp", vec!["ocr"])]).unwrap(),
        }
    }

    #[test]
    fn test_bootstrap_reports_status() {
        let engine = WavefrontEngine::bootstrap(EngineConfig::default(), collaborators()).unwrap();
        let status = engine.status();
        assert_eq!(status.adapters, 2);
        assert_eq!(status.live_workflows, 0);
        assert!(status.open_circuits.is_empty());
        assert_eq!(engine.scheduler().execution_order(), vec!["ocr", "nlp"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.scheduler.max_concurrency = 0;
        let result = WavefrontEngine::bootstrap(config, collaborators());
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
