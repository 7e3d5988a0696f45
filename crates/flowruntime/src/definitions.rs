use crate::validate::validate_graph;
use async_trait::async_trait;
use flowcore::{FlowDefinition, Map, Value, WorkflowError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Source of published workflow definitions and their constants
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Load a published definition. `None` selects the latest version.
    /// Fails when the flow is missing or disabled.
    async fn get_published(
        &self,
        flow_id: &str,
        version: Option<u32>,
    ) -> Result<Arc<FlowDefinition>, WorkflowError>;

    /// Project-level constants overridden by the flow's own constants
    async fn constants(&self, flow_id: &str) -> Result<Map, WorkflowError>;
}

/// In-process definition source; every registered version stays loadable
#[derive(Default)]
pub struct InMemoryDefinitions {
    flows: RwLock<HashMap<String, Vec<Arc<FlowDefinition>>>>,
    project_constants: RwLock<Map>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and publish a definition. Re-registering a version replaces it.
    pub async fn register(&self, definition: FlowDefinition) -> Result<(), WorkflowError> {
        validate_graph(&definition.graph)?;
        tracing::info!(flow_id = %definition.id, version = definition.version, "Registering workflow");
        let mut flows = self.flows.write().await;
        let versions = flows.entry(definition.id.clone()).or_default();
        versions.retain(|d| d.version != definition.version);
        versions.push(Arc::new(definition));
        versions.sort_by_key(|d| d.version);
        Ok(())
    }

    pub async fn set_project_constant(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.project_constants.write().await.insert(key.into(), value.into());
    }

    /// Latest version of every flow
    pub async fn list(&self) -> Vec<Arc<FlowDefinition>> {
        let flows = self.flows.read().await;
        let mut latest: Vec<_> = flows.values().filter_map(|v| v.last().cloned()).collect();
        latest.sort_by(|a, b| a.id.cmp(&b.id));
        latest
    }
}

#[async_trait]
impl DefinitionSource for InMemoryDefinitions {
    async fn get_published(
        &self,
        flow_id: &str,
        version: Option<u32>,
    ) -> Result<Arc<FlowDefinition>, WorkflowError> {
        let flows = self.flows.read().await;
        let versions = flows
            .get(flow_id)
            .ok_or_else(|| WorkflowError::NotFound(flow_id.to_string()))?;
        let definition = match version {
            Some(v) => versions.iter().find(|d| d.version == v),
            None => versions.last(),
        }
        .ok_or_else(|| WorkflowError::NotFound(format!("{}@{}", flow_id, version.unwrap_or_default())))?;

        if !definition.enabled {
            return Err(WorkflowError::Disabled(flow_id.to_string()));
        }
        Ok(definition.clone())
    }

    async fn constants(&self, flow_id: &str) -> Result<Map, WorkflowError> {
        let mut constants = self.project_constants.read().await.clone();
        if let Some(definition) = self.flows.read().await.get(flow_id).and_then(|v| v.last()) {
            constants.extend(definition.constants.clone());
        }
        Ok(constants)
    }
}
