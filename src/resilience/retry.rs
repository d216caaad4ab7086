//! # Retry Policies
//!
//! Backoff calculation and the error strategy applied once retries are exhausted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Single attempt, no retries
    None,
    Fixed,
    Exponential,
    JitteredExponential,
}

/// Retry policy value applied to one adapter call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,

    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,

    /// Fraction of the computed delay used as uniform +/- jitter
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::JitteredExponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    /// Attempts actually allowed under this policy
    pub fn effective_max_attempts(&self) -> u32 {
        match self.strategy {
            RetryStrategy::None => 1,
            _ => self.max_attempts.max(1),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            ));
        }
        if self.exponential_base < 1.0 {
            return Err("exponential_base must be at least 1".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must not be smaller than base_delay".to_string());
        }
        Ok(())
    }

    /// Exponential delay for `attempt` (1-based) before the `max_delay` cap
    pub fn pre_cap_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.exponential_base.powi(exponent);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor)
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Exponential => self.capped_exponential(attempt),
            RetryStrategy::JitteredExponential => {
                let value = self.capped_exponential(attempt).as_secs_f64();
                let spread = self.jitter_factor * value;
                // uniform in [-spread, +spread]
                let jitter = (fastrand::f64() * 2.0 - 1.0) * spread;
                let jittered = (value + jitter).clamp(0.0, self.max_delay.as_secs_f64());
                Duration::from_secs_f64(jittered).min(self.max_delay)
            }
        }
    }

    fn capped_exponential(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64()
            * self
                .exponential_base
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        if !raw.is_finite() || raw >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw)
        }
    }
}

/// What to do once an item's retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStrategy {
    /// Surface the failure and stop the workflow from dispatching more items
    FailFast,
    /// Mark the step skipped and continue
    Skip,
    /// Substitute the registered fallback value and continue degraded
    Fallback,
    /// Run registered compensation, then surface the failure
    #[default]
    Compensate,
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => write!(f, "FAIL_FAST"),
            Self::Skip => write!(f, "SKIP"),
            Self::Fallback => write!(f, "FALLBACK"),
            Self::Compensate => write!(f, "COMPENSATE"),
        }
    }
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FAIL_FAST" => Ok(Self::FailFast),
            "SKIP" => Ok(Self::Skip),
            "FALLBACK" => Ok(Self::Fallback),
            "COMPENSATE" => Ok(Self::Compensate),
            _ => Err(format!("Invalid error strategy: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(base_secs: u64, max_secs: u64) -> RetryPolicy {
        RetryPolicy {
            strategy: RetryStrategy::Exponential,
            max_attempts: 4,
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(max_secs),
            exponential_base: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_pre_cap_sequence() {
        let policy = exponential(1, 100);
        let delays: Vec<u64> = (1..=4)
            .map(|attempt| policy.pre_cap_delay(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_exponential_is_capped() {
        let policy = exponential(1, 5);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_and_none() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(25));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(25));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(25));

        let none = RetryPolicy::no_retry();
        assert_eq!(none.effective_max_attempts(), 1);
        assert_eq!(none.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::JitteredExponential,
            jitter_factor: 0.5,
            ..exponential(1, 100)
        };
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(3).as_secs_f64();
            assert!((2.0..=6.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::JitteredExponential,
            jitter_factor: 1.0,
            ..exponential(1, 5)
        };
        for attempt in [3, 4, 10] {
            for _ in 0..200 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay <= policy.max_delay, "delay {delay:?} above cap");
            }
        }
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            jitter_factor: -0.1,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_error_strategy_parsing() {
        assert_eq!("fail_fast".parse::<ErrorStrategy>(), Ok(ErrorStrategy::FailFast));
        assert_eq!(ErrorStrategy::Fallback.to_string(), "FALLBACK");
        assert!("retry_forever".parse::<ErrorStrategy>().is_err());
    }
}
