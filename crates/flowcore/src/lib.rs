//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the value model, workflow graphs, the execution
//! context with its namespace resolver, the node handler contract and the
//! durable execution records.

mod context;
mod error;
pub mod events;
pub mod expression;
mod node;
mod record;
pub mod resolver;
mod value;
mod workflow;

pub use context::{ContextSnapshot, ExecutionContext};
pub use error::{FlowError, NodeError, StoreError, WorkflowError};
pub use events::*;
pub use node::{NodeHandler, NodeMetadata, NodeResult};
pub use record::{
    AsyncCallbackRecord, CallbackStatus, ExecutionStatus, FlowExecutionRecord, NodeExecutionRecord,
    NodeExecutionStatus,
};
pub use resolver::{contains_unresolved_variables, Resolver};
pub use value::{Map, Value};
pub use workflow::{node_types, Edge, FlowDefinition, FlowId, Graph, NodeId, NodeSpec};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
