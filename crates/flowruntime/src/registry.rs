use flowcore::{NodeHandler, NodeMetadata, WorkflowError};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available node types, built once at startup and handed to
/// the engine
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a node handler, replacing any previous handler for its type
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        let node_type = handler.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.handlers.insert(node_type, handler);
    }

    /// Look up the handler for a node type
    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeHandler>, WorkflowError> {
        self.handlers
            .get(node_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.handlers.get(node_type).map(|h| h.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
