//! # Workflow State
//!
//! Immutable, versioned workflow state and the store that serializes writers
//! per workflow id.
//!
//! ## Components
//!
//! - **Types**: [`WorkflowState`], [`StepResult`] and their status enums
//! - **Store**: [`StateStore`] with optimistic concurrency and audit history
//! - **Persistence**: [`DurableSink`] implementations and the document format

pub mod persistence;
pub mod store;
pub mod types;

pub use persistence::{
    DurableSink, FileSystemSink, InMemorySink, StepResultDocument, WorkflowStateDocument,
};
pub use store::StateStore;
pub use types::{StateChange, StepResult, StepStatus, WorkflowState, WorkflowStatus};
