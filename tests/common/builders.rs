//! Engine builders shared by integration tests

use super::adapters::ScriptedAdapter;
use std::sync::Arc;
use wavefront_core::config::{EngineConfig, RetrySettings};
use wavefront_core::orchestration::{DependencyGraph, EngineCollaborators, WavefrontEngine};
use wavefront_core::registry::{
    AcceptAllValidator, Adapter, InMemoryAdapterRegistry, ItemContext, StaticContextProvider,
};
use wavefront_core::resilience::RetryStrategy;

/// Default config with three attempts and 1 ms fixed backoff
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetrySettings {
        strategy: RetryStrategy::Fixed,
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 1,
        exponential_base: 2.0,
        jitter_factor: 0.0,
    };
    config.boundary.default_timeout_ms = 5_000;
    config
}

pub fn engine_with(
    config: EngineConfig,
    adapters: &[Arc<ScriptedAdapter>],
    edges: Vec<(&str, Vec<&str>)>,
    contexts: Vec<ItemContext>,
) -> WavefrontEngine {
    let adapters = adapters
        .iter()
        .map(|adapter| Arc::clone(adapter) as Arc<dyn Adapter>)
        .collect();
    engine_with_adapters(config, adapters, edges, contexts)
}

/// Engine over arbitrary adapter implementations
pub fn engine_with_adapters(
    config: EngineConfig,
    adapters: Vec<Arc<dyn Adapter>>,
    edges: Vec<(&str, Vec<&str>)>,
    contexts: Vec<ItemContext>,
) -> WavefrontEngine {
    let registry = InMemoryAdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }

    let collaborators = EngineCollaborators {
        registry: Arc::new(registry),
        contexts: Arc::new(StaticContextProvider::from_contexts(contexts)),
        validator: Arc::new(AcceptAllValidator),
        graph: DependencyGraph::new(edges).expect("test graph must be acyclic"),
    };
    WavefrontEngine::bootstrap(config, collaborators).expect("test engine bootstrap")
}

pub fn engine(
    adapters: &[Arc<ScriptedAdapter>],
    edges: Vec<(&str, Vec<&str>)>,
    contexts: Vec<ItemContext>,
) -> WavefrontEngine {
    engine_with(fast_config(), adapters, edges, contexts)
}

pub fn ids(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Best-effort test logging; repeated initialization is ignored
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
