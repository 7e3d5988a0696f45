use crate::context::ExecutionContext;
use crate::value::Value;
use crate::workflow::NodeSpec;
use crate::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Core trait that all executable node types implement.
///
/// Handlers are stateless: everything they need comes from the node's
/// config and the execution context. They may write context variables but
/// never inputs, constants or node outputs.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Type tag this handler serves (e.g. "api", "condition")
    fn node_type(&self) -> &str;

    /// Execute one node. An `Err` is recorded as a node failure.
    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError>;

    /// Optional: description shown by node listings
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Outcome of a single node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum NodeResult {
    Success { output: Value },
    Fail { message: String },
    /// Suspend the run until a callback with `callback_key` arrives
    Pause {
        callback_key: String,
        execution_data: Value,
    },
    /// A nested run is suspended; this run pauses without a callback record
    Waiting { reason: String, execution_data: Value },
    Skipped { reason: String },
}

impl NodeResult {
    pub fn success(output: impl Into<Value>) -> Self {
        NodeResult::Success { output: output.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        NodeResult::Fail { message: message.into() }
    }

    pub fn pause(callback_key: impl Into<String>, execution_data: impl Into<Value>) -> Self {
        NodeResult::Pause {
            callback_key: callback_key.into(),
            execution_data: execution_data.into(),
        }
    }

    pub fn waiting(reason: impl Into<String>, execution_data: impl Into<Value>) -> Self {
        NodeResult::Waiting {
            reason: reason.into(),
            execution_data: execution_data.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        NodeResult::Skipped { reason: reason.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeResult::Success { .. })
    }
}

/// Metadata about a node type
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
}

impl NodeMetadata {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
        }
    }
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}
