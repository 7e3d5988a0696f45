use async_trait::async_trait;
use flowcore::{node_types, ExecutionContext, NodeError, NodeHandler, NodeMetadata, NodeResult, NodeSpec, Value};
use flowruntime::end_outputs;

/// Entry node; outputs the run inputs
pub struct StartNode;

#[async_trait]
impl NodeHandler for StartNode {
    fn node_type(&self) -> &str {
        node_types::START
    }

    async fn execute(&self, _node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        Ok(NodeResult::success(ctx.inputs().clone()))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Workflow entry point", "flow")
    }
}

/// Exit node; evaluates the declared output variables
pub struct EndNode;

#[async_trait]
impl NodeHandler for EndNode {
    fn node_type(&self) -> &str {
        node_types::END
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let outputs = end_outputs(node, ctx);
        tracing::debug!(node_id = %node.id, count = outputs.len(), "Evaluated end outputs");
        Ok(NodeResult::success(Value::object([
            ("status", Value::from("completed")),
            ("message", Value::from("flow completed")),
            ("outputs", Value::Object(outputs)),
        ])))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Workflow exit point with declared outputs", "flow")
    }
}
