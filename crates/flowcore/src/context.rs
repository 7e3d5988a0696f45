use crate::events::{EventEmitter, ExecutionId};
use crate::resolver::Resolver;
use crate::value::{Map, Value};
use crate::workflow::{FlowId, Graph, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-run data model shared by the engine and node handlers.
///
/// Inputs and constants never change after construction. Node outputs are
/// written by the engine only; handlers may write variables.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    flow_id: FlowId,
    graph: Arc<Graph>,
    current_node_id: Option<NodeId>,
    inputs: Map,
    node_outputs: Map,
    variables: Map,
    constants: Map,
    call_chain: Vec<FlowId>,
    completed_nodes: Vec<NodeId>,
    events: Option<EventEmitter>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, flow_id: impl Into<FlowId>, graph: Arc<Graph>, inputs: Map) -> Self {
        Self {
            execution_id,
            flow_id: flow_id.into(),
            graph,
            current_node_id: None,
            inputs,
            node_outputs: Map::new(),
            variables: Map::new(),
            constants: Map::new(),
            call_chain: Vec::new(),
            completed_nodes: Vec::new(),
            events: None,
        }
    }

    pub fn with_constants(mut self, constants: Map) -> Self {
        self.constants = constants;
        self
    }

    /// Ancestor flow ids of this run, outermost first
    pub fn with_call_chain(mut self, call_chain: Vec<FlowId>) -> Self {
        self.call_chain = call_chain;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Rebuild a context from a persisted snapshot. The graph is reloaded
    /// from the definition source by the caller.
    pub fn restore(
        execution_id: ExecutionId,
        flow_id: impl Into<FlowId>,
        graph: Arc<Graph>,
        snapshot: ContextSnapshot,
    ) -> Self {
        Self {
            execution_id,
            flow_id: flow_id.into(),
            graph,
            current_node_id: snapshot.current_node_id,
            inputs: snapshot.inputs,
            node_outputs: snapshot.node_outputs,
            variables: snapshot.variables,
            constants: snapshot.constants,
            call_chain: snapshot.call_chain,
            completed_nodes: snapshot.completed_nodes,
            events: None,
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            current_node_id: self.current_node_id.clone(),
            inputs: self.inputs.clone(),
            node_outputs: self.node_outputs.clone(),
            variables: self.variables.clone(),
            constants: self.constants.clone(),
            call_chain: self.call_chain.clone(),
            completed_nodes: self.completed_nodes.clone(),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn current_node_id(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    pub fn set_current_node(&mut self, node_id: impl Into<NodeId>) {
        self.current_node_id = Some(node_id.into());
    }

    pub fn inputs(&self) -> &Map {
        &self.inputs
    }

    pub fn node_outputs(&self) -> &Map {
        &self.node_outputs
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    pub fn set_node_output(&mut self, node_id: impl Into<NodeId>, output: Value) {
        self.node_outputs.insert(node_id.into(), output);
    }

    pub fn variables(&self) -> &Map {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn constants(&self) -> &Map {
        &self.constants
    }

    pub fn call_chain(&self) -> &[FlowId] {
        &self.call_chain
    }

    pub fn mark_completed(&mut self, node_id: &str) {
        if !self.is_completed(node_id) {
            self.completed_nodes.push(node_id.to_string());
        }
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed_nodes.iter().any(|n| n == node_id)
    }

    pub fn completed_nodes(&self) -> &[NodeId] {
        &self.completed_nodes
    }

    /// Report progress for the current node on the event bus
    pub fn info(&self, message: impl Into<String>) {
        if let (Some(events), Some(node_id)) = (&self.events, self.current_node_id()) {
            events.info(node_id, message);
        }
    }

    pub fn warn(&self, message: impl Into<String>) {
        if let (Some(events), Some(node_id)) = (&self.events, self.current_node_id()) {
            events.warn(node_id, message);
        }
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        if let (Some(events), Some(node_id)) = (&self.events, self.current_node_id()) {
            events.progress(node_id, percent, message);
        }
    }

    /// Resolver over this context's namespaces
    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self)
    }
}

/// Durable, serialization-safe image of an [`ExecutionContext`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSnapshot {
    pub current_node_id: Option<NodeId>,
    pub inputs: Map,
    pub node_outputs: Map,
    pub variables: Map,
    pub constants: Map,
    pub call_chain: Vec<FlowId>,
    pub completed_nodes: Vec<NodeId>,
}

impl ContextSnapshot {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self).map(Value::from)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.to_json())
    }
}
