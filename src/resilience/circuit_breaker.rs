//! # Circuit Breaker Implementation
//!
//! Per-adapter admission control. Failures are weighted by severity and summed
//! over a rolling window; crossing the threshold opens the circuit.
//!
//! ```text
//!            weighted failures >= threshold
//!   CLOSED ─────────────────────────────────▶ OPEN
//!     ▲                                        │  cooldown elapsed
//!     │ success_threshold trial successes      ▼
//!     └──────────────────────────────────── HALF_OPEN
//!                  failed trial ──▶ OPEN (cooldown restarts)
//! ```
//!
//! Admission never blocks: an open circuit answers `false` immediately.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics, FailureSeverity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - limited trial calls allowed
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    /// (recorded at, weight) pairs inside the rolling window
    failures: VecDeque<(Instant, f64)>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl WindowState {
    fn prune(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        while let Some((recorded_at, _)) = self.failures.front() {
            if now.duration_since(*recorded_at) > config.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn weighted_total(&self) -> f64 {
        self.failures.iter().map(|(_, weight)| weight).sum()
    }
}

/// Core circuit breaker with atomic state and a mutex-guarded failure window
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Adapter id for logging and metrics
    name: String,

    /// Current circuit state (atomic for lock-free reads)
    state: AtomicU8,

    config: CircuitBreakerConfig,

    window: Mutex<WindowState>,

    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            adapter = %name,
            failure_threshold = config.failure_threshold,
            window_ms = config.window.as_millis() as u64,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            window: Mutex::new(WindowState::default()),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admission predicate consulted before dispatching a call.
    ///
    /// Moves an open circuit to half-open once the cooldown has elapsed. Does
    /// not reserve a trial slot; use [`CircuitBreaker::try_acquire`] for that.
    pub fn can_execute(&self) -> bool {
        let mut window = self.window.lock();
        let admitted = self.admit(&mut window, false);
        if !admitted {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Admission check that also reserves a half-open trial slot.
    ///
    /// Every `true` must be followed by exactly one `record_success` or
    /// `record_failure`.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock();
        let admitted = self.admit(&mut window, true);
        if !admitted {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            debug!(adapter = %self.name, state = %self.state(), "Call rejected by circuit breaker");
        }
        admitted
    }

    fn admit(&self, window: &mut WindowState, reserve: bool) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = window
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return false;
                }
                self.transition_to_half_open(window);
                self.admit_trial(window, reserve)
            }
            CircuitState::HalfOpen => self.admit_trial(window, reserve),
        }
    }

    fn admit_trial(&self, window: &mut WindowState, reserve: bool) -> bool {
        if window.half_open_in_flight >= self.config.half_open_max_calls {
            return false;
        }
        if reserve {
            window.half_open_in_flight += 1;
        }
        true
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);

        let mut window = self.window.lock();
        match self.state() {
            CircuitState::HalfOpen => {
                window.half_open_in_flight = window.half_open_in_flight.saturating_sub(1);
                window.half_open_successes += 1;
                if window.half_open_successes >= self.config.success_threshold {
                    self.transition_to_closed(&mut window);
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                debug!(adapter = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed call with the given severity
    pub fn record_failure(&self, severity: FailureSeverity) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut window = self.window.lock();
        match self.state() {
            CircuitState::Closed => {
                window.failures.push_back((now, severity.weight()));
                window.prune(&self.config, now);
                let weighted = window.weighted_total();

                debug!(
                    adapter = %self.name,
                    severity = ?severity,
                    weighted_failures = weighted,
                    failure_threshold = self.config.failure_threshold,
                    "Failure recorded"
                );

                if weighted >= self.config.failure_threshold {
                    self.transition_to_open(&mut window, weighted);
                }
            }
            CircuitState::HalfOpen => {
                window.half_open_in_flight = window.half_open_in_flight.saturating_sub(1);
                warn!(adapter = %self.name, "Trial call failed, reopening circuit");
                self.transition_to_open(&mut window, severity.weight());
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_closed(&self, window: &mut WindowState) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        window.failures.clear();
        window.opened_at = None;
        window.opened_at_wall = None;
        window.half_open_in_flight = 0;
        window.half_open_successes = 0;

        info!(
            adapter = %self.name,
            total_calls = self.total_calls.load(Ordering::Relaxed),
            "Circuit breaker closed (recovered)"
        );
    }

    fn transition_to_open(&self, window: &mut WindowState, weighted: f64) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        window.failures.clear();
        window.opened_at = Some(Instant::now());
        window.opened_at_wall = Some(Utc::now());
        window.half_open_in_flight = 0;
        window.half_open_successes = 0;

        error!(
            adapter = %self.name,
            weighted_failures = weighted,
            failure_threshold = self.config.failure_threshold,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Circuit breaker opened (failing fast)"
        );
    }

    fn transition_to_half_open(&self, window: &mut WindowState) {
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        window.half_open_in_flight = 0;
        window.half_open_successes = 0;

        info!(
            adapter = %self.name,
            half_open_max_calls = self.config.half_open_max_calls,
            "Circuit breaker half-open (testing recovery)"
        );
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(adapter = %self.name, "Circuit breaker forced open");
        let mut window = self.window.lock();
        let weighted = window.weighted_total();
        self.transition_to_open(&mut window, weighted);
    }

    /// Force circuit to closed state
    pub fn force_closed(&self) {
        warn!(adapter = %self.name, "Circuit breaker forced closed");
        let mut window = self.window.lock();
        self.transition_to_closed(&mut window);
    }

    /// Close the circuit and zero every counter
    pub fn reset(&self) {
        let mut window = self.window.lock();
        *window = WindowState::default();
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        for counter in [
            &self.total_calls,
            &self.success_count,
            &self.failure_count,
            &self.rejected_count,
            &self.times_opened,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        info!(adapter = %self.name, "Circuit breaker reset");
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut window = self.window.lock();
        window.prune(&self.config, Instant::now());

        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let failure_rate = if total_calls > 0 {
            failure_count as f64 / total_calls as f64
        } else {
            0.0
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count,
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            weighted_failures: window.weighted_total(),
            times_opened: self.times_opened.load(Ordering::Relaxed),
            current_state: self.state(),
            opened_at: window.opened_at_wall,
            failure_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn config(threshold: f64, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(10),
            cooldown: Duration::from_millis(cooldown_ms),
            success_threshold: 1,
            half_open_max_calls: 1,
        }
    }

    #[test]
    fn test_starts_closed_and_admits() {
        let breaker = CircuitBreaker::new("ocr", config(3.0, 100));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
        assert!(breaker.try_acquire());
        breaker.record_success();

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.current_state, CircuitState::Closed);
    }

    #[test]
    fn test_weighted_failures_open_circuit() {
        let breaker = CircuitBreaker::new("ocr", config(3.0, 10_000));

        breaker.record_failure(FailureSeverity::Medium);
        breaker.record_failure(FailureSeverity::Low);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().weighted_failures, 1.5);

        breaker.record_failure(FailureSeverity::Medium);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure(FailureSeverity::Low);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        let metrics = breaker.metrics();
        assert_eq!(metrics.times_opened, 1);
        assert_eq!(metrics.rejected_count, 1);
        assert!(metrics.opened_at.is_some());
    }

    #[test]
    fn test_high_severity_opens_faster() {
        let breaker = CircuitBreaker::new("llm", config(3.0, 10_000));
        breaker.record_failure(FailureSeverity::High);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(FailureSeverity::Medium);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_then_recovers() {
        let breaker = CircuitBreaker::new("ocr", config(1.0, 30));
        breaker.record_failure(FailureSeverity::Medium);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        sleep(Duration::from_millis(50)).await;

        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.try_acquire());
        // Trial slot taken
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("ocr", config(1.0, 30));
        breaker.record_failure(FailureSeverity::Medium);
        sleep(Duration::from_millis(50)).await;

        assert!(breaker.try_acquire());
        breaker.record_failure(FailureSeverity::Low);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.metrics().times_opened, 2);
    }

    #[tokio::test]
    async fn test_failures_outside_window_expire() {
        let breaker = CircuitBreaker::new(
            "ocr",
            CircuitBreakerConfig {
                failure_threshold: 2.0,
                window: Duration::from_millis(30),
                ..config(2.0, 1_000)
            },
        );

        breaker.record_failure(FailureSeverity::Medium);
        sleep(Duration::from_millis(50)).await;
        breaker.record_failure(FailureSeverity::Medium);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_force_and_reset() {
        let breaker = CircuitBreaker::new("ocr", config(5.0, 10_000));

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        breaker.force_closed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());

        breaker.record_failure(FailureSeverity::Medium);
        breaker.reset();
        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 0);
        assert_eq!(metrics.weighted_failures, 0.0);
        assert_eq!(metrics.times_opened, 0);
    }

    #[test]
    fn test_state_from_u8_defaults_to_open() {
        assert_eq!(CircuitState::from(0), CircuitState::Closed);
        assert_eq!(CircuitState::from(2), CircuitState::HalfOpen);
        assert_eq!(CircuitState::from(9), CircuitState::Open);
    }
}
