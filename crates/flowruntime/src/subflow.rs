use crate::engine::{FlowEngine, RunRequest};
use async_trait::async_trait;
use flowcore::{
    node_types, ExecutionContext, ExecutionStatus, FlowExecutionRecord, FlowId, Map, NodeError, NodeHandler,
    NodeMetadata, NodeResult, NodeSpec, Value,
};
use std::sync::{Arc, Weak};

/// Runs another published flow synchronously as a single node
pub struct SubflowHandler {
    engine: Weak<FlowEngine>,
}

impl SubflowHandler {
    pub fn new(engine: Weak<FlowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NodeHandler for SubflowHandler {
    fn node_type(&self) -> &str {
        node_types::SUBFLOW
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let engine = upgrade(&self.engine)?;
        let subflow_id = node.require_config_str("subflowId")?.to_string();
        let version = node
            .config("subflowVersion")
            .and_then(Value::as_i64)
            .map(|v| v as u32);

        let chain = match child_chain(ctx, &subflow_id) {
            Ok(chain) => chain,
            Err(message) => return Ok(NodeResult::fail(message)),
        };
        let inputs = map_inputs(node, ctx, Map::new(), None);

        ctx.info(format!("Invoking sub-workflow {}", subflow_id));
        let request = RunRequest::new(subflow_id.clone(), inputs)
            .with_version(version)
            .with_call_chain(chain)
            .with_parent(ctx.execution_id(), node.id.clone());

        let record = match engine.execute(request).await {
            Ok(record) => record,
            Err(e) => return Ok(NodeResult::fail(format!("sub-workflow execution failed: {}", e))),
        };

        match record.status {
            ExecutionStatus::Completed => {
                let outputs = flatten_outputs(&record);
                ctx.set_variable(output_variable_name(node), Value::Object(outputs.clone()));
                Ok(NodeResult::success(outputs))
            }
            ExecutionStatus::Paused => Ok(NodeResult::waiting(
                format!("sub-workflow {} is waiting", subflow_id),
                Value::object([
                    ("subExecutionId", Value::from(record.id.to_string())),
                    ("subflowId", Value::from(subflow_id)),
                ]),
            )),
            _ => Ok(NodeResult::fail(format!(
                "sub-workflow execution failed: {}",
                record.error_message.unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Run another published workflow and return its outputs", "flow")
    }
}

pub(crate) fn upgrade(engine: &Weak<FlowEngine>) -> Result<Arc<FlowEngine>, NodeError> {
    engine
        .upgrade()
        .ok_or_else(|| NodeError::ExecutionFailed("flow engine has shut down".to_string()))
}

/// Call chain for a child run, or the cycle message when `target` is
/// already on it
pub(crate) fn child_chain(ctx: &ExecutionContext, target: &str) -> Result<Vec<FlowId>, String> {
    let mut chain = ctx.call_chain().to_vec();
    if chain.last().map(String::as_str) != Some(ctx.flow_id()) {
        chain.push(ctx.flow_id().to_string());
    }
    if chain.iter().any(|id| id == target) {
        let mut path = chain.clone();
        path.push(target.to_string());
        let message = format!("circular sub-workflow call detected: {}", path.join(" -> "));
        tracing::warn!(flow_id = %ctx.flow_id(), target, "{}", message);
        return Err(message);
    }
    Ok(chain)
}

/// Build child inputs from `inputMappings`, on top of `base`. `locals` is
/// an overlay namespace visible to the source expressions.
pub(crate) fn map_inputs(node: &NodeSpec, ctx: &ExecutionContext, mut base: Map, locals: Option<&Map>) -> Map {
    let resolver = match locals {
        Some(locals) => ctx.resolver().with_locals(locals),
        None => ctx.resolver(),
    };
    for mapping in node.config_array("inputMappings") {
        let target = mapping
            .get("targetVariable")
            .or_else(|| mapping.get("targetParam"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());
        let source = mapping.get("sourceExpression").and_then(Value::as_str);
        if let (Some(target), Some(source)) = (target, source) {
            base.insert(target.to_string(), resolver.resolve(source));
        }
    }
    base
}

/// Child end outputs plus `_executionId` and `_status`
pub(crate) fn flatten_outputs(record: &FlowExecutionRecord) -> Map {
    let mut outputs = record
        .output_data
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    outputs.insert("_executionId".to_string(), Value::from(record.id.to_string()));
    let status = serde_json::to_value(record.status).map(Value::from).unwrap_or_default();
    outputs.insert("_status".to_string(), status);
    outputs
}

fn output_variable_name(node: &NodeSpec) -> String {
    if let Some(name) = node.config_str("outputVariableName") {
        return name.to_string();
    }
    match node.label.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => {
            let sanitized: String = label
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '_' })
                .collect();
            format!("{}_output", sanitized)
        }
        None => format!("subflow_{}_output", node.id),
    }
}
