//! # External Interfaces
//!
//! The collaborators the engine depends on but does not implement:
//!
//! ```text
//! External Interfaces
//! ├── AdapterRegistry   (call adapters, list methods for pre-flight checks)
//! ├── ContextProvider   (per-item chain, dependencies, error strategy)
//! └── OutputValidator   (verdict on normalized adapter output)
//! ```
//!
//! In-memory implementations are provided for embedding and tests.

pub mod adapter;
pub mod context;
pub mod validator;

pub use adapter::{
    Adapter, AdapterError, AdapterOutput, AdapterRegistry, AdapterResult, InMemoryAdapterRegistry,
    InvocationStatus, Kwargs,
};
pub use context::{ArgumentSource, ChainStep, ContextProvider, ItemContext, StaticContextProvider};
pub use validator::{
    AcceptAllValidator, OutputValidator, RequiredFieldsValidator, ValidationVerdict,
};
