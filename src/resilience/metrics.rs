//! # Circuit Breaker Metrics
//!
//! Point-in-time snapshots of breaker health, per adapter and engine-wide.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that were admitted and reported an outcome
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,

    /// Calls refused because the circuit was open
    pub rejected_count: u64,

    /// Severity-weighted failures currently inside the rolling window
    pub weighted_failures: f64,

    /// Number of times the circuit has opened
    pub times_opened: u64,

    pub current_state: CircuitState,

    /// Wall-clock time the circuit last opened, if it is open or half-open
    pub opened_at: Option<DateTime<Utc>>,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,
}

impl CircuitBreakerMetrics {
    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing adapter health",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Failures: {} | Rejected: {} | Weighted: {:.2}",
            self.state_description(),
            self.total_calls,
            self.failure_count,
            self.rejected_count,
            self.weighted_failures
        )
    }
}

/// Engine-wide breaker metrics keyed by adapter id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: BTreeMap<String, CircuitBreakerMetrics>,
}

impl SystemCircuitBreakerMetrics {
    pub fn add_circuit_breaker(&mut self, adapter: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(adapter, metrics);
    }

    /// Adapters whose circuit is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        self.circuit_breakers
            .iter()
            .filter(|(_, metrics)| metrics.current_state == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn total_rejections(&self) -> u64 {
        self.circuit_breakers
            .values()
            .map(|metrics| metrics.rejected_count)
            .sum()
    }
}
