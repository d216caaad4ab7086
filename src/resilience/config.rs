//! # Circuit Breaker Configuration
//!
//! Configuration for a single adapter's breaker. Engine-wide settings and
//! per-adapter overrides live in [`crate::config::CircuitBreakerSettings`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Severity-weighted failure total within `window` that opens the circuit
    pub failure_threshold: f64,

    /// Rolling window over which failures are counted
    pub window: Duration,

    /// Time spent open before a trial call is admitted
    pub cooldown: Duration,

    /// Successful trial calls needed in half-open state to close the circuit
    pub success_threshold: u32,

    /// Trial calls admitted concurrently while half-open
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    /// Tight breaker for adapters that front remote services
    pub fn for_remote_adapter() -> Self {
        Self {
            failure_threshold: 3.0,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(45),
            success_threshold: 1,
            half_open_max_calls: 1,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if !(self.failure_threshold > 0.0) {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.window.is_zero() {
            return Err("window must be greater than 0".to_string());
        }

        if self.cooldown.is_zero() {
            return Err("cooldown must be greater than 0".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5.0,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
            half_open_max_calls: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::for_remote_adapter().validate().is_ok());

        let invalid = CircuitBreakerConfig {
            failure_threshold: 0.0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        let invalid = CircuitBreakerConfig {
            cooldown: Duration::ZERO,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        let invalid = CircuitBreakerConfig {
            half_open_max_calls: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }
}
