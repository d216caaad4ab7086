//! # Resilience Module
//!
//! Fault tolerance for adapter calls:
//!
//! - **Circuit breakers**: per-adapter admission control with severity-weighted windows
//! - **Retry policies**: fixed, exponential and jittered exponential backoff
//! - **Failure classification**: maps adapter and boundary errors onto a closed taxonomy
//! - **Compensation**: best-effort undo actions run when a step fails for good
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wavefront_core::config::CircuitBreakerSettings;
//! use wavefront_core::registry::AdapterError;
//! use wavefront_core::resilience::{
//!     CircuitBreakerRegistry, ResilienceManager, ResilienceOutcome, ResilienceRequest,
//! };
//!
//! # async fn example() {
//! let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default()));
//! let manager = ResilienceManager::new(breakers);
//!
//! let outcome = manager
//!     .execute_with_resilience(&ResilienceRequest::new("ocr.scan", "ocr"), |_attempt| async {
//!         Ok::<_, AdapterError>("text")
//!     })
//!     .await;
//! assert!(matches!(outcome, ResilienceOutcome::Success { .. }));
//! # }
//! ```

pub mod breaker_registry;
pub mod circuit_breaker;
pub mod classifier;
pub mod compensation;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod retry;

pub use breaker_registry::CircuitBreakerRegistry;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classifier::{FailureClassifier, FailureKind, FailureSeverity, StandardFailureClassifier};
pub use compensation::{CompensationAction, CompensationRecord, CompensationRegistry};
pub use config::CircuitBreakerConfig;
pub use manager::{
    BoundaryDecision, BoundaryFailureContext, FailureRecord, ResilienceManager,
    ResilienceOutcome, ResilienceRequest, ResilienceStats,
};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use retry::{ErrorStrategy, RetryPolicy, RetryStrategy};
