use crate::value::{Map, Value};
use crate::NodeError;
use serde::{Deserialize, Serialize};

pub type FlowId = String;
pub type NodeId = String;

/// Node type tags understood by the built-in handlers
pub mod node_types {
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const CONDITION: &str = "condition";
    pub const TRANSFORM: &str = "transform";
    pub const VARIABLE_ASSIGNER: &str = "variableAssigner";
    pub const JSON_PARSER: &str = "jsonParser";
    pub const API: &str = "api";
    pub const DELAY: &str = "delay";
    pub const SUBFLOW: &str = "subflow";
    pub const FOR_EACH: &str = "forEach";
}

/// Published, versioned workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: FlowId,
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Flow-level constants, overriding project-level ones
    #[serde(default)]
    pub constants: Map,
    pub graph: Graph,
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, graph: Graph) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: 1,
            description: None,
            enabled: true,
            constants: Map::new(),
            graph,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_constant(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Immutable node/edge graph of one workflow version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.push_edge(source.into(), target.into(), None);
    }

    /// Connect from a named output handle of the source node
    pub fn connect_handle(
        &mut self,
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) {
        self.push_edge(source.into(), target.into(), Some(handle.into()));
    }

    fn push_edge(&mut self, source: String, target: String, source_handle: Option<String>) {
        self.edges.push(Edge {
            id: format!("e{}-{}-{}", self.edges.len(), source, target),
            source,
            target,
            source_handle,
            target_handle: None,
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_type == node_types::START)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}

/// A node declared in a flow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub config: Map,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: None,
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label if set, otherwise the id
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    pub fn config(&self, key: &str) -> Option<&Value> {
        self.config.get(key).filter(|v| !v.is_null())
    }

    /// Non-empty string config value
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn config_bool(&self, key: &str) -> bool {
        match self.config(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn config_array(&self, key: &str) -> &[Value] {
        self.config(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn require_config_str(&self, key: &str) -> Result<&str, NodeError> {
        self.config_str(key)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", key)))
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl Edge {
    /// Source handle with empty strings treated as unset
    pub fn handle(&self) -> Option<&str> {
        self.source_handle.as_deref().filter(|h| !h.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_editor_graph() {
        let graph: Graph = serde_json::from_value(json!({
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "c", "type": "condition", "label": "Check", "config": {"expression": "true"}}
            ],
            "edges": [{"id": "e1", "source": "s", "target": "c", "sourceHandle": ""}]
        }))
        .unwrap();

        assert_eq!(graph.start_node().map(|n| n.id.as_str()), Some("s"));
        assert_eq!(graph.find_node("c").map(NodeSpec::display_name), Some("Check"));
        assert_eq!(graph.outgoing("s").next().and_then(Edge::handle), None);
    }

    #[test]
    fn config_accessors_ignore_blank_values() {
        let node = NodeSpec::new("n", node_types::API)
            .with_config("url", "  ")
            .with_config("waitForCallback", true);
        assert!(node.config_str("url").is_none());
        assert!(node.require_config_str("url").is_err());
        assert!(node.config_bool("waitForCallback"));
    }
}
