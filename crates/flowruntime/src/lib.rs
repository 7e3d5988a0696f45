//! Workflow execution runtime
//!
//! This crate provides the engine that walks workflow graphs node by node,
//! pauses runs on asynchronous callbacks and resumes them from durable
//! snapshots, plus the node registry, execution store and the sub-workflow
//! and fan-out nodes that re-enter the engine.

mod callback;
mod definitions;
mod engine;
mod foreach;
mod precondition;
mod registry;
mod runtime;
mod store;
mod subflow;
mod validate;

pub use callback::{AsyncCallbackRegistry, CallbackClaim, CallbackOutcome, ExpiredCallbackPolicy};
pub use definitions::{DefinitionSource, InMemoryDefinitions};
pub use engine::{end_outputs, FlowEngine, RunRequest};
pub use foreach::ForEachHandler;
pub use precondition::should_execute;
pub use registry::NodeRegistry;
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use subflow::SubflowHandler;
pub use validate::validate_graph;
