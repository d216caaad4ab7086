//! # Circuit Breaker Registry
//!
//! Process-wide set of breakers keyed by adapter id. Breakers are created on
//! first use and outlive individual workflows, so their state reflects adapter
//! health rather than any one run. Breaker state is not persisted.

use crate::config::CircuitBreakerSettings;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitState, FailureSeverity,
    SystemCircuitBreakerMetrics,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of per-adapter circuit breakers
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        info!(
            enabled = settings.enabled,
            overrides = settings.adapters.len(),
            "Initializing circuit breaker registry"
        );
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Get or create the breaker for an adapter
    pub fn get(&self, adapter: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(adapter) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(adapter.to_string()).or_insert_with(|| {
            let config = self.settings.config_for_adapter(adapter);
            info!(adapter = adapter, "Created new circuit breaker");
            Arc::new(CircuitBreaker::new(adapter, config))
        });
        Arc::clone(entry.value())
    }

    /// Admission predicate used for pre-flight checks. Always `true` when the
    /// registry is disabled.
    pub fn can_execute(&self, adapter: &str) -> bool {
        !self.settings.enabled || self.get(adapter).can_execute()
    }

    /// Admission that reserves a half-open trial slot
    pub fn try_acquire(&self, adapter: &str) -> bool {
        !self.settings.enabled || self.get(adapter).try_acquire()
    }

    pub fn record_success(&self, adapter: &str) {
        if self.settings.enabled {
            self.get(adapter).record_success();
        }
    }

    pub fn record_failure(&self, adapter: &str, severity: FailureSeverity) {
        if self.settings.enabled {
            self.get(adapter).record_failure(severity);
        }
    }

    /// Current state of every breaker created so far
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    pub fn state(&self, adapter: &str) -> Option<CircuitState> {
        self.breakers.get(adapter).map(|breaker| breaker.state())
    }

    pub fn metrics(&self, adapter: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(adapter).map(|breaker| breaker.metrics())
    }

    pub fn system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system = SystemCircuitBreakerMetrics::default();
        for entry in self.breakers.iter() {
            system.add_circuit_breaker(entry.key().clone(), entry.value().metrics());
        }
        system
    }

    pub fn force_open(&self, adapter: &str) {
        self.get(adapter).force_open();
    }

    pub fn force_closed(&self, adapter: &str) {
        self.get(adapter).force_closed();
    }

    /// Reset one breaker, or every breaker when `adapter` is `None`
    pub fn reset(&self, adapter: Option<&str>) {
        match adapter {
            Some(adapter) => {
                if let Some(breaker) = self.breakers.get(adapter) {
                    breaker.reset();
                }
            }
            None => {
                warn!(count = self.breakers.len(), "Resetting all circuit breakers");
                for entry in self.breakers.iter() {
                    entry.value().reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerComponentConfig;

    fn settings_with_fragile(adapter: &str) -> CircuitBreakerSettings {
        let mut settings = CircuitBreakerSettings::default();
        settings.adapters.insert(
            adapter.to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 1.0,
                cooldown_ms: 60_000,
                ..Default::default()
            },
        );
        settings
    }

    #[test]
    fn test_lazy_creation_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.states().is_empty());

        let first = registry.get("ocr");
        let second = registry.get("ocr");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.states().len(), 1);
    }

    #[test]
    fn test_per_adapter_override_applies() {
        let registry = CircuitBreakerRegistry::new(settings_with_fragile("ocr"));

        registry.record_failure("ocr", FailureSeverity::Medium);
        registry.record_failure("nlp", FailureSeverity::Medium);

        assert_eq!(registry.state("ocr"), Some(CircuitState::Open));
        assert_eq!(registry.state("nlp"), Some(CircuitState::Closed));
        assert!(!registry.can_execute("ocr"));
        assert!(registry.can_execute("nlp"));
        assert_eq!(registry.system_metrics().open_circuits(), vec!["ocr".to_string()]);
    }

    #[test]
    fn test_disabled_registry_always_admits() {
        let mut settings = settings_with_fragile("ocr");
        settings.enabled = false;
        let registry = CircuitBreakerRegistry::new(settings);

        registry.record_failure("ocr", FailureSeverity::Critical);
        assert!(registry.can_execute("ocr"));
        assert!(registry.try_acquire("ocr"));
        assert!(registry.states().is_empty());
    }

    #[test]
    fn test_force_and_reset() {
        let registry = CircuitBreakerRegistry::default();
        registry.force_open("llm");
        assert!(!registry.can_execute("llm"));

        registry.reset(Some("llm"));
        assert_eq!(registry.state("llm"), Some(CircuitState::Closed));

        registry.force_open("llm");
        registry.force_open("ocr");
        registry.reset(None);
        assert!(registry
            .states()
            .values()
            .all(|state| *state == CircuitState::Closed));
    }
}
