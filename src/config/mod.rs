//! # Wavefront Configuration System
//!
//! Typed engine configuration with validated, layered loading.
//!
//! ## Architecture
//!
//! - **Defaults first**: every section has a working default, so an empty file is valid
//! - **Layered overrides**: base file, environment file, then `WAVEFRONT__*` variables
//! - **Explicit validation**: impossible values are rejected at load time
//!
//! ## Usage
//!
//! ```rust,no_run
//! use wavefront_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let retry = manager.config().retry.to_policy();
//! let pool = manager.config().scheduler.max_concurrency;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::resilience::{CircuitBreakerConfig, RetryPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-adapter admission control
    pub circuit_breakers: CircuitBreakerSettings,

    /// Default retry policy applied to adapter calls
    pub retry: RetrySettings,

    /// Dependency scheduler settings
    pub scheduler: SchedulerConfig,

    /// Invocation boundary settings
    pub module_controller: ModuleControllerConfig,

    /// Workflow state persistence
    pub state_store: StateStoreConfig,

    /// Event bus sizing
    pub events: EventsConfig,

    /// Delegated execution protocol
    pub boundary: BoundaryConfig,
}

impl EngineConfig {
    /// Validate every section, failing on the first impossible value
    pub fn validate(&self) -> ConfigResult<()> {
        self.circuit_breakers.validate()?;
        self.retry.validate()?;

        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_concurrency",
                0,
                "must be greater than 0",
            ));
        }

        if self.events.subscriber_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.subscriber_capacity",
                0,
                "must be greater than 0",
            ));
        }

        if self.state_store.backend == PersistenceBackend::File
            && self.state_store.directory.trim().is_empty()
        {
            return Err(ConfigurationError::invalid_value(
                "state_store.directory",
                "",
                "file backend requires a directory",
            ));
        }

        if self.boundary.default_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "boundary.default_timeout_ms",
                0,
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Circuit breaker settings for all adapters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// When disabled every adapter is always admitted
    pub enabled: bool,

    /// Configuration used for adapters without an explicit override
    pub default_config: CircuitBreakerComponentConfig,

    /// Per-adapter overrides keyed by adapter id
    pub adapters: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_config: CircuitBreakerComponentConfig::default(),
            adapters: HashMap::new(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Resolve the breaker configuration for one adapter
    pub fn config_for_adapter(&self, adapter: &str) -> CircuitBreakerConfig {
        self.adapters
            .get(adapter)
            .unwrap_or(&self.default_config)
            .to_resilience_config()
    }

    fn validate(&self) -> ConfigResult<()> {
        self.default_config
            .to_resilience_config()
            .validate()
            .map_err(|reason| {
                ConfigurationError::invalid_value("circuit_breakers.default_config", "-", reason)
            })?;

        for (adapter, component) in &self.adapters {
            component
                .to_resilience_config()
                .validate()
                .map_err(|reason| {
                    ConfigurationError::invalid_value(
                        format!("circuit_breakers.adapters.{adapter}"),
                        "-",
                        reason,
                    )
                })?;
        }
        Ok(())
    }
}

/// File representation of a single breaker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    /// Severity-weighted failures within the window that open the circuit
    pub failure_threshold: f64,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            window_ms: defaults.window.as_millis() as u64,
            cooldown_ms: defaults.cooldown.as_millis() as u64,
            success_threshold: defaults.success_threshold,
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

impl CircuitBreakerComponentConfig {
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            window: Duration::from_millis(self.window_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            success_threshold: self.success_threshold,
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

/// File representation of the default retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            strategy: policy.strategy,
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            exponential_base: policy.exponential_base,
            jitter_factor: policy.jitter_factor,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: self.strategy,
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter_factor: self.jitter_factor,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        self.to_policy()
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("retry", "-", reason))
    }
}

/// Dependency scheduler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum steps of one wave executing concurrently
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

/// Invocation boundary settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModuleControllerConfig {
    /// Route adapter calls through the resilience manager
    pub resilience_enabled: bool,

    /// Inject workflow context fields into adapter kwargs
    pub inject_context: bool,
}

impl Default for ModuleControllerConfig {
    fn default() -> Self {
        Self {
            resilience_enabled: true,
            inject_context: true,
        }
    }
}

/// Durable sink selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateStoreConfig {
    pub backend: PersistenceBackend,

    /// Directory for the file backend
    pub directory: String,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            directory: "state".to_string(),
        }
    }
}

impl StateStoreConfig {
    pub fn directory_path(&self) -> PathBuf {
        PathBuf::from(&self.directory)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded channel capacity per subscriber
    pub subscriber_capacity: usize,

    /// Number of recent events retained for audit
    pub audit_log_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            audit_log_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BoundaryConfig {
    pub default_timeout_ms: u64,

    /// Redeliveries of one request before a retry decision turns into a failure
    pub max_redeliveries: u32,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_redeliveries: 3,
        }
    }
}

impl BoundaryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.circuit_breakers.enabled);
        assert_eq!(config.scheduler.max_concurrency, 4);
    }

    #[test]
    fn test_adapter_override_resolution() {
        let mut settings = CircuitBreakerSettings::default();
        settings.adapters.insert(
            "flaky".to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 2.0,
                cooldown_ms: 10,
                ..Default::default()
            },
        );

        let flaky = settings.config_for_adapter("flaky");
        assert_eq!(flaky.failure_threshold, 2.0);
        assert_eq!(flaky.cooldown, Duration::from_millis(10));

        let other = settings.config_for_adapter("steady");
        assert_eq!(
            other.failure_threshold,
            CircuitBreakerConfig::default().failure_threshold
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.scheduler.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_settings_round_trip_to_policy() {
        let settings = RetrySettings {
            strategy: RetryStrategy::Exponential,
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            exponential_base: 2.0,
            jitter_factor: 0.0,
        };
        let policy = settings.to_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 4);
    }
}
