#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    node_types, ExecutionContext, FlowDefinition, Graph, Map, NodeError, NodeHandler, NodeResult, NodeSpec, Value,
};
use flowruntime::{end_outputs, FlowRuntime, NodeRegistry, RuntimeConfig};
use std::sync::Arc;
use std::time::Duration;

pub struct Start;

#[async_trait]
impl NodeHandler for Start {
    fn node_type(&self) -> &str {
        node_types::START
    }

    async fn execute(&self, _node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        Ok(NodeResult::success(ctx.inputs().clone()))
    }
}

pub struct End;

#[async_trait]
impl NodeHandler for End {
    fn node_type(&self) -> &str {
        node_types::END
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        Ok(NodeResult::success(Value::object([("outputs", Value::Object(end_outputs(node, ctx)))])))
    }
}

/// `{y: input.x * 2}`
pub struct Double;

#[async_trait]
impl NodeHandler for Double {
    fn node_type(&self) -> &str {
        "double"
    }

    async fn execute(&self, _node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let x = ctx
            .inputs()
            .get("x")
            .and_then(Value::as_f64)
            .ok_or_else(|| NodeError::MissingInput("x".to_string()))?;
        Ok(NodeResult::success(Value::object([("y", Value::from(x * 2.0))])))
    }
}

/// Picks the handle named in `config.handle`
pub struct Branch;

#[async_trait]
impl NodeHandler for Branch {
    fn node_type(&self) -> &str {
        node_types::CONDITION
    }

    async fn execute(&self, node: &NodeSpec, _ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let handle = node.require_config_str("handle")?;
        Ok(NodeResult::success(Value::object([("matchedHandleId", Value::from(handle))])))
    }
}

/// Pauses on `config.key`
pub struct Wait;

#[async_trait]
impl NodeHandler for Wait {
    fn node_type(&self) -> &str {
        "wait"
    }

    async fn execute(&self, node: &NodeSpec, _ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let key = node.require_config_str("key")?;
        Ok(NodeResult::pause(key, Value::object([("requestId", Value::from("r-1"))])))
    }
}

/// Sleeps `config.ms` (resolved), then outputs `config.value` (resolved)
pub struct Sleep;

#[async_trait]
impl NodeHandler for Sleep {
    fn node_type(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let (ms, value) = {
            let resolver = ctx.resolver();
            let ms = node
                .config("ms")
                .map(|raw| resolver.resolve_value(raw))
                .and_then(|v| v.to_number())
                .unwrap_or(0.0) as u64;
            let value = node.config("value").map(|raw| resolver.resolve_value(raw)).unwrap_or_default();
            (ms, value)
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(NodeResult::success(Value::object([("value", value)])))
    }
}

/// Fails when `input.fail` is truthy
pub struct MaybeFail;

#[async_trait]
impl NodeHandler for MaybeFail {
    fn node_type(&self) -> &str {
        "maybeFail"
    }

    async fn execute(&self, _node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        if ctx.inputs().get("fail").is_some_and(Value::is_truthy) {
            return Ok(NodeResult::fail("asked to fail"));
        }
        Ok(NodeResult::success(Value::object([("ok", Value::from(true))])))
    }
}

pub fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(Start));
    registry.register(Arc::new(End));
    registry.register(Arc::new(Double));
    registry.register(Arc::new(Branch));
    registry.register(Arc::new(Wait));
    registry.register(Arc::new(Sleep));
    registry.register(Arc::new(MaybeFail));
    registry
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

pub fn runtime() -> FlowRuntime {
    init_tracing();
    FlowRuntime::new(registry())
}

pub fn runtime_with(config: RuntimeConfig) -> FlowRuntime {
    init_tracing();
    FlowRuntime::with_config(registry(), config)
}

pub fn json_map(value: serde_json::Value) -> Map {
    Value::from(value).as_object().cloned().unwrap_or_default()
}

pub fn end_node(outputs: serde_json::Value) -> NodeSpec {
    NodeSpec::new("end", node_types::END).with_config("outputVariables", Value::from(outputs))
}

/// `start -> <middle...> -> end`, chained in order
pub fn linear(id: &str, middle: Vec<NodeSpec>, end: NodeSpec) -> FlowDefinition {
    let mut graph = Graph::new();
    let mut previous = graph.add_node(NodeSpec::new("start", node_types::START));
    for node in middle {
        let id = graph.add_node(node);
        graph.connect(previous.clone(), id.clone());
        previous = id;
    }
    let end_id = graph.add_node(end);
    graph.connect(previous, end_id);
    FlowDefinition::new(id, graph)
}
