//! # Events
//!
//! Immutable engine events and the bus that delivers them. Every event carries
//! the correlation id of the run that produced it.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusStats, EventFilter};
pub use types::{EngineEvent, EventPayload, EventType};
