//! # Boundary Protocol
//!
//! Correlation-id stamped message exchange used when chain execution is
//! delegated to a separately deployed executor.
//!
//! ```text
//! BoundaryInitiator                 EventBus                 DelegatedExecutor
//!       | -- SubProcessInitiated -->   |   -- Initiated -->          |
//!       |                              |                        run chains
//!       | <-- Completed / Failed ----  |  <-- Completed / Failed --  |
//! ```
//!
//! ## Components
//!
//! - **Messages**: [`SubProcessInitiated`], [`SubProcessCompleted`], [`SubProcessFailed`]
//! - **Initiator**: [`BoundaryInitiator`] tracking pending requests by correlation id
//! - **Executor**: [`DelegatedExecutor`] answering each request exactly once per delivery

pub mod delegated;
pub mod initiator;
pub mod messages;

pub use delegated::DelegatedExecutor;
pub use initiator::{BoundaryInitiator, BoundaryResolution, PendingSnapshot};
pub use messages::{
    BoundaryMessage, SubProcessCompleted, SubProcessFailed, SubProcessInitiated,
    SubProcessRequest, SubProcessResponse,
};
