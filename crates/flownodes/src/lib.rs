//! Standard node library
//!
//! Built-in handlers for the node types the editor produces. The
//! sub-workflow and fan-out nodes live in `flowruntime` because they
//! re-enter the engine.

mod condition;
mod http;
mod lifecycle;
mod regex_ops;
mod time;
mod transform;
mod variable;

pub use condition::ConditionNode;
pub use http::ApiNode;
pub use lifecycle::{EndNode, StartNode};
pub use time::DelayNode;
pub use transform::{JsonParserNode, TransformNode};
pub use variable::VariableAssignerNode;
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(StartNode));
    registry.register(Arc::new(EndNode));
    registry.register(Arc::new(ConditionNode));
    registry.register(Arc::new(TransformNode));
    registry.register(Arc::new(VariableAssignerNode));
    registry.register(Arc::new(JsonParserNode));
    registry.register(Arc::new(ApiNode::new()));
    registry.register(Arc::new(DelayNode));
}

/// A registry holding every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
