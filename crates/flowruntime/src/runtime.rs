use crate::callback::{CallbackOutcome, ExpiredCallbackPolicy};
use crate::definitions::InMemoryDefinitions;
use crate::engine::{FlowEngine, RunRequest};
use crate::registry::NodeRegistry;
use crate::store::{ExecutionStore, InMemoryExecutionStore};
use chrono::Utc;
use flowcore::{
    AsyncCallbackRecord, EventBus, ExecutionEvent, ExecutionId, FlowDefinition, FlowError, FlowExecutionRecord,
    Map, NodeExecutionRecord, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Main entry point: wires the registry, store, definitions, engine and
/// event bus together
pub struct FlowRuntime {
    engine: Arc<FlowEngine>,
    definitions: Arc<InMemoryDefinitions>,
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
}

impl FlowRuntime {
    /// Create a runtime with default settings and in-memory persistence
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: NodeRegistry, config: RuntimeConfig) -> Self {
        Self::with_store(registry, Arc::new(InMemoryExecutionStore::new()), config)
    }

    /// Create a runtime over a custom execution store
    pub fn with_store(registry: NodeRegistry, store: Arc<dyn ExecutionStore>, config: RuntimeConfig) -> Self {
        let definitions = Arc::new(InMemoryDefinitions::new());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let engine = FlowEngine::new(registry, store.clone(), definitions.clone(), event_bus.clone(), config);

        Self {
            engine,
            definitions,
            store,
            event_bus,
        }
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn definitions(&self) -> &Arc<InMemoryDefinitions> {
        &self.definitions
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.engine.registry()
    }

    /// Validate and publish a workflow definition
    pub async fn register_flow(&self, definition: FlowDefinition) -> Result<(), FlowError> {
        self.definitions.register(definition).await?;
        Ok(())
    }

    /// Run a published flow; `None` selects its latest version
    pub async fn execute(
        &self,
        flow_id: &str,
        version: Option<u32>,
        inputs: Map,
    ) -> Result<FlowExecutionRecord, FlowError> {
        self.engine
            .execute(RunRequest::new(flow_id, inputs).with_version(version))
            .await
    }

    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        data: Value,
    ) -> Result<Option<FlowExecutionRecord>, FlowError> {
        self.engine.resume(execution_id, data).await
    }

    pub async fn handle_callback(&self, callback_key: &str, data: Value) -> Result<CallbackOutcome, FlowError> {
        self.engine.handle_callback(callback_key, data).await
    }

    /// Expire overdue callbacks as of now
    pub async fn expire_callbacks(&self) -> Result<Vec<AsyncCallbackRecord>, FlowError> {
        self.engine.expire_callbacks(Utc::now()).await
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<FlowExecutionRecord>, FlowError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    pub async fn list_executions(&self) -> Result<Vec<FlowExecutionRecord>, FlowError> {
        Ok(self.store.list_executions().await?)
    }

    pub async fn node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecutionRecord>, FlowError> {
        Ok(self.store.node_executions(execution_id).await?)
    }

    pub async fn get_callback(&self, callback_key: &str) -> Result<Option<AsyncCallbackRecord>, FlowError> {
        Ok(self.engine.callbacks().get(callback_key).await?)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Periodically expire overdue callbacks in the background
    pub fn spawn_expiry_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match engine.expire_callbacks(Utc::now()).await {
                    Ok(expired) if !expired.is_empty() => {
                        tracing::info!(count = expired.len(), "Expired overdue callbacks");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Callback expiry sweep failed: {}", e),
                }
            }
        })
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Lifetime of a waiting callback before it expires
    pub callback_ttl: Duration,
    /// Default bound on concurrently running fan-out iterations
    pub max_parallel_iterations: usize,
    /// Nodes visited per traversal before the run is failed
    pub max_steps: usize,
    pub event_buffer_size: usize,
    pub expired_callback_policy: ExpiredCallbackPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            callback_ttl: Duration::from_secs(24 * 60 * 60),
            max_parallel_iterations: 8,
            max_steps: 10_000,
            event_buffer_size: 1000,
            expired_callback_policy: ExpiredCallbackPolicy::KeepPaused,
        }
    }
}
