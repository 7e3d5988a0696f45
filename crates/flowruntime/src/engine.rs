use crate::callback::{AsyncCallbackRegistry, CallbackClaim, CallbackOutcome, ExpiredCallbackPolicy};
use crate::definitions::DefinitionSource;
use crate::foreach::ForEachHandler;
use crate::precondition::should_execute;
use crate::registry::NodeRegistry;
use crate::runtime::RuntimeConfig;
use crate::store::ExecutionStore;
use crate::subflow::SubflowHandler;
use chrono::{DateTime, Utc};
use flowcore::{
    node_types, AsyncCallbackRecord, CallbackStatus, ContextSnapshot, EventBus, ExecutionContext,
    ExecutionEvent, ExecutionId, ExecutionStatus, FlowError, FlowExecutionRecord, FlowId, Graph, Map,
    NodeExecutionRecord, NodeExecutionStatus, NodeId, NodeResult, NodeSpec, StoreError, Value,
    WorkflowError,
};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Request to start a new run of a published flow
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub flow_id: FlowId,
    pub version: Option<u32>,
    pub inputs: Map,
    /// Ancestor flow ids, outermost first
    pub call_chain: Vec<FlowId>,
    pub parent: Option<(ExecutionId, NodeId)>,
}

impl RunRequest {
    pub fn new(flow_id: impl Into<FlowId>, inputs: Map) -> Self {
        Self {
            flow_id: flow_id.into(),
            version: None,
            inputs,
            call_chain: Vec::new(),
            parent: None,
        }
    }

    pub fn with_version(mut self, version: Option<u32>) -> Self {
        self.version = version;
        self
    }

    pub fn with_call_chain(mut self, call_chain: Vec<FlowId>) -> Self {
        self.call_chain = call_chain;
        self
    }

    pub fn with_parent(mut self, execution_id: ExecutionId, node_id: impl Into<NodeId>) -> Self {
        self.parent = Some((execution_id, node_id.into()));
        self
    }
}

/// Node-by-node traversal state machine with durable pause/resume.
///
/// A run walks from the start node following one edge at a time. Condition
/// nodes pick the edge matching their `matchedHandleId`; every other node
/// may have at most one outgoing edge. A handler that returns
/// [`NodeResult::Pause`] suspends the run: the context is snapshotted, a
/// callback record is written and the call returns. [`FlowEngine::resume`]
/// rebuilds the context from the snapshot and continues after the paused
/// node.
pub struct FlowEngine {
    registry: NodeRegistry,
    store: Arc<dyn ExecutionStore>,
    definitions: Arc<dyn DefinitionSource>,
    callbacks: AsyncCallbackRegistry,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl FlowEngine {
    /// Build an engine around an adapter registry. The sub-workflow and
    /// fan-out handlers are registered here with a weak handle back to the
    /// engine.
    pub fn new(
        mut registry: NodeRegistry,
        store: Arc<dyn ExecutionStore>,
        definitions: Arc<dyn DefinitionSource>,
        event_bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|engine: &Weak<FlowEngine>| {
            registry.register(Arc::new(SubflowHandler::new(engine.clone())));
            registry.register(Arc::new(ForEachHandler::new(
                engine.clone(),
                config.max_parallel_iterations,
            )));
            let callbacks = AsyncCallbackRegistry::new(store.clone(), config.callback_ttl);
            Self {
                registry,
                store,
                definitions,
                callbacks,
                event_bus,
                config,
            }
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionSource> {
        &self.definitions
    }

    pub fn callbacks(&self) -> &AsyncCallbackRegistry {
        &self.callbacks
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start a run and drive it until it completes, fails or pauses.
    ///
    /// Returns `Err` only when the flow cannot be loaded or the store fails;
    /// node failures are reported through the returned record.
    pub async fn execute(&self, request: RunRequest) -> Result<FlowExecutionRecord, FlowError> {
        let definition = self
            .definitions
            .get_published(&request.flow_id, request.version)
            .await?;
        let mut constants = self.definitions.constants(&definition.id).await?;
        constants.extend(definition.constants.clone());
        let graph = Arc::new(definition.graph.clone());
        let inputs = apply_input_defaults(&graph, request.inputs);

        let mut record = FlowExecutionRecord::new(
            definition.id.clone(),
            definition.version,
            Value::Object(inputs.clone()),
        );
        if let Some((parent_id, parent_node)) = request.parent {
            record = record.with_parent(parent_id, parent_node);
        }
        self.store.insert_execution(record.clone()).await?;

        let ctx = ExecutionContext::new(record.id, definition.id.clone(), graph.clone(), inputs)
            .with_constants(constants)
            .with_call_chain(request.call_chain)
            .with_events(self.event_bus.create_emitter(record.id));

        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        self.store.update_execution(&record).await?;

        tracing::info!(
            execution_id = %record.id,
            flow_id = %record.flow_id,
            parent = ?record.parent_execution_id,
            "Starting workflow execution"
        );
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id: record.id,
            flow_id: record.flow_id.clone(),
            parent_execution_id: record.parent_execution_id,
            timestamp: Utc::now(),
        });

        let Some(start) = graph.start_node() else {
            return self.fail(record, &ctx, WorkflowError::MissingStartNode.to_string()).await;
        };
        self.traverse(record, ctx, start.id.clone()).await
    }

    /// Resume a paused run with the given payload. Returns `None` when the
    /// run was not paused (already resumed, or still pausing).
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        data: Value,
    ) -> Result<Option<FlowExecutionRecord>, FlowError> {
        if !self
            .store
            .transition_execution(execution_id, ExecutionStatus::Paused, ExecutionStatus::Running)
            .await?
        {
            tracing::warn!(execution_id = %execution_id, "Resume ignored: execution is not paused");
            return Ok(None);
        }
        let record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("execution", execution_id.to_string()))?;
        self.resume_claimed(record, data).await.map(Some)
    }

    /// Deliver a payload for a callback key: claim it, resume the run
    /// exactly once and mark it processed.
    ///
    /// A callback only resumes the run while it is paused at the node the
    /// callback was issued for. Replies for a node that has since moved on
    /// are retired and reported as ignored.
    pub async fn handle_callback(&self, callback_key: &str, data: Value) -> Result<CallbackOutcome, FlowError> {
        match self.callbacks.claim(callback_key, data.clone()).await? {
            CallbackClaim::Claimed(callback) => {
                tracing::info!(callback_key, execution_id = %callback.execution_id, "Callback received");
                if self
                    .store
                    .transition_execution_at(
                        callback.execution_id,
                        &callback.node_id,
                        ExecutionStatus::Paused,
                        ExecutionStatus::Running,
                    )
                    .await?
                {
                    let record = self
                        .store
                        .get_execution(callback.execution_id)
                        .await?
                        .ok_or_else(|| StoreError::not_found("execution", callback.execution_id.to_string()))?;
                    let payload = callback.callback_data.clone().unwrap_or(data);
                    let record = self.resume_claimed(record, payload).await?;
                    self.callbacks.mark_processed(callback_key).await?;
                    return Ok(CallbackOutcome::Resumed(record));
                }
                if self.is_pausing_for(&callback).await? {
                    tracing::info!(callback_key, "Run still pausing; it will pick up the reply");
                    return Ok(CallbackOutcome::Deferred);
                }
                self.callbacks.retire(callback_key).await?;
                tracing::warn!(
                    callback_key,
                    execution_id = %callback.execution_id,
                    node_id = %callback.node_id,
                    "Stale callback ignored: run is not waiting on this node"
                );
                Ok(CallbackOutcome::Ignored(CallbackStatus::Processed))
            }
            CallbackClaim::AlreadyHandled(status) => {
                tracing::warn!(callback_key, ?status, "Duplicate callback ignored");
                Ok(CallbackOutcome::Ignored(status))
            }
            CallbackClaim::Expired(callback) => {
                self.apply_expiry_policy(&callback).await?;
                Ok(CallbackOutcome::Expired)
            }
        }
    }

    /// Whether the node execution that issued `callback` is still waiting,
    /// meaning its traversal has not yet finished pausing
    async fn is_pausing_for(&self, callback: &AsyncCallbackRecord) -> Result<bool, FlowError> {
        let Some(record) = self.store.get_execution(callback.execution_id).await? else {
            return Ok(false);
        };
        if !matches!(record.status, ExecutionStatus::Running | ExecutionStatus::Paused) {
            return Ok(false);
        }
        let latest = self
            .store
            .latest_node_execution(callback.execution_id, &callback.node_id)
            .await?;
        Ok(latest.is_some_and(|n| n.id == callback.node_execution_id && n.status == NodeExecutionStatus::Waiting))
    }

    /// Expire waiting callbacks past their deadline and apply the
    /// configured policy to their runs
    pub async fn expire_callbacks(&self, now: DateTime<Utc>) -> Result<Vec<AsyncCallbackRecord>, FlowError> {
        let expired = self.callbacks.expire_due(now).await?;
        for callback in &expired {
            self.apply_expiry_policy(callback).await?;
        }
        Ok(expired)
    }

    async fn apply_expiry_policy(&self, callback: &AsyncCallbackRecord) -> Result<(), FlowError> {
        if self.config.expired_callback_policy != ExpiredCallbackPolicy::FailExecution {
            return Ok(());
        }
        // Only a run still waiting on this callback's node is failed
        if !self
            .store
            .transition_execution_at(
                callback.execution_id,
                &callback.node_id,
                ExecutionStatus::Paused,
                ExecutionStatus::Failed,
            )
            .await?
        {
            tracing::debug!(callback_key = %callback.callback_key, "Expired callback no longer holds its run");
            return Ok(());
        }
        let message = format!("callback {} expired", callback.callback_key);
        if let Some(mut node_record) = self.store.get_node_execution(callback.node_execution_id).await? {
            node_record.error_message = Some(message.clone());
            node_record.finish(NodeExecutionStatus::Failed);
            self.store.update_node_execution(&node_record).await?;
        }
        if let Some(mut record) = self.store.get_execution(callback.execution_id).await? {
            record.error_message = Some(message);
            record.completed_at = Some(Utc::now());
            self.store.update_execution(&record).await?;
            tracing::error!(execution_id = %record.id, callback_key = %callback.callback_key, "Execution failed: callback expired");
            self.emit_finished(&record);
        }
        Ok(())
    }

    /// Continue a run this caller has already moved from PAUSED to RUNNING
    async fn resume_claimed(&self, record: FlowExecutionRecord, data: Value) -> Result<FlowExecutionRecord, FlowError> {
        let snapshot = record
            .context_snapshot
            .as_ref()
            .map(ContextSnapshot::from_value)
            .transpose()?
            .unwrap_or_default();

        let graph = match self
            .definitions
            .get_published(&record.flow_id, Some(record.flow_version))
            .await
        {
            Ok(definition) => Arc::new(definition.graph.clone()),
            Err(e) => {
                let ctx = ExecutionContext::restore(record.id, record.flow_id.clone(), Arc::new(Graph::new()), snapshot);
                return self.fail(record, &ctx, e.to_string()).await;
            }
        };

        let mut ctx = ExecutionContext::restore(record.id, record.flow_id.clone(), graph.clone(), snapshot)
            .with_events(self.event_bus.create_emitter(record.id));
        if ctx.constants().is_empty() {
            ctx = ctx.with_constants(self.definitions.constants(&record.flow_id).await?);
        }

        let paused_node = record.current_node_id.clone().or_else(|| ctx.current_node_id().map(str::to_string));
        let Some(node) = paused_node.as_deref().and_then(|id| graph.find_node(id)) else {
            let message = format!("paused node not found: {}", paused_node.unwrap_or_default());
            return self.fail(record, &ctx, message).await;
        };

        tracing::info!(execution_id = %record.id, node_id = %node.id, "Resuming workflow execution");
        self.event_bus.emit(ExecutionEvent::WorkflowResumed {
            execution_id: record.id,
            node_id: node.id.clone(),
            timestamp: Utc::now(),
        });

        ctx.set_current_node(&node.id);
        let output = self.complete_paused_node(&mut ctx, node, data).await?;
        match self.next_step(node, &ctx, &output) {
            Ok(Some(next)) => self.traverse(record, ctx, next).await,
            Ok(None) => self.complete(record, ctx, node, output).await,
            Err(message) => self.fail(record, &ctx, message).await,
        }
    }

    async fn traverse(
        &self,
        mut record: FlowExecutionRecord,
        mut ctx: ExecutionContext,
        first: NodeId,
    ) -> Result<FlowExecutionRecord, FlowError> {
        let graph = ctx.graph().clone();
        let mut node_id = first;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > self.config.max_steps {
                let message = format!("step limit of {} exceeded", self.config.max_steps);
                return self.fail(record, &ctx, message).await;
            }
            let Some(node) = graph.find_node(&node_id) else {
                return self.fail(record, &ctx, WorkflowError::NodeNotFound(node_id).to_string()).await;
            };
            if ctx.is_completed(&node.id) {
                let message = format!("node {} reached twice; the graph contains a cycle", node.id);
                return self.fail(record, &ctx, message).await;
            }

            ctx.set_current_node(&node.id);
            record.current_node_id = Some(node.id.clone());

            let (result, node_record) = self.run_node(node, &mut ctx).await?;
            let output = match result {
                NodeResult::Success { output } => {
                    apply_success(node, &mut ctx, output.clone());
                    output
                }
                NodeResult::Skipped { .. } => {
                    let output = Value::Object(Map::new());
                    apply_success(node, &mut ctx, output.clone());
                    output
                }
                NodeResult::Fail { message } => return self.fail(record, &ctx, message).await,
                NodeResult::Waiting { reason, .. } => {
                    tracing::info!(execution_id = %record.id, node_id = %node.id, %reason, "Node waiting on nested run");
                    return self.pause(record, &ctx, None).await;
                }
                NodeResult::Pause { callback_key, .. } => {
                    let topic = node
                        .config_str("callbackTopic")
                        .or_else(|| node.config_str("topic"))
                        .filter(|t| !t.is_empty())
                        .map(str::to_string);
                    self.callbacks
                        .register(&callback_key, record.id, node_record.id, &node.id, topic)
                        .await?;
                    record = self.pause(record, &ctx, Some(callback_key.clone())).await?;

                    // The reply can arrive before the run finished pausing
                    match self.take_early_callback(&record, &callback_key).await? {
                        Some((running, data)) => {
                            record = running;
                            self.complete_paused_node(&mut ctx, node, data).await?
                        }
                        None => return Ok(record),
                    }
                }
            };

            match self.next_step(node, &ctx, &output) {
                Ok(Some(next)) => node_id = next,
                Ok(None) => return self.complete(record, ctx, node, output).await,
                Err(message) => return self.fail(record, &ctx, message).await,
            }
        }
    }

    /// Invoke one node's handler and persist its node execution record
    async fn run_node(
        &self,
        node: &NodeSpec,
        ctx: &mut ExecutionContext,
    ) -> Result<(NodeResult, NodeExecutionRecord), FlowError> {
        let execution_id = ctx.execution_id();
        let mut node_record = NodeExecutionRecord::running(execution_id, node.id.clone(), node.node_type.clone());
        node_record.node_label = node.label.clone();
        node_record.input_data = Some(Value::Object(node.config.clone()));

        let gated = node.node_type != node_types::START && node.node_type != node_types::END;
        if gated && !should_execute(node, ctx) {
            let reason = "execution condition not met".to_string();
            tracing::info!(execution_id = %execution_id, node_id = %node.id, "Node skipped: {}", reason);
            node_record.error_message = Some(reason.clone());
            node_record.finish(NodeExecutionStatus::Skipped);
            self.store.insert_node_execution(node_record.clone()).await?;
            self.event_bus.emit(ExecutionEvent::NodeSkipped {
                execution_id,
                node_id: node.id.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            return Ok((NodeResult::skipped(reason), node_record));
        }

        self.store.insert_node_execution(node_record.clone()).await?;
        self.event_bus.emit(ExecutionEvent::NodeStarted {
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            timestamp: Utc::now(),
        });

        tracing::debug!(
            execution_id = %execution_id,
            node_id = %node.id,
            node_type = %node.node_type,
            "Executing node {}",
            node.display_name()
        );
        let start = Instant::now();
        let result = match self.registry.get(&node.node_type) {
            Ok(handler) => handler
                .execute(node, ctx)
                .await
                .unwrap_or_else(|e| NodeResult::fail(e.to_string())),
            Err(e) => NodeResult::fail(e.to_string()),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            NodeResult::Success { output } => {
                tracing::info!(execution_id = %execution_id, node_id = %node.id, "Node completed in {}ms", duration_ms);
                node_record.output_data = Some(output.clone());
                node_record.finish(NodeExecutionStatus::Completed);
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id,
                    node_id: node.id.clone(),
                    output: output.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            NodeResult::Fail { message } => {
                tracing::error!(execution_id = %execution_id, node_id = %node.id, "Node failed: {}", message);
                node_record.error_message = Some(message.clone());
                node_record.finish(NodeExecutionStatus::Failed);
                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    execution_id,
                    node_id: node.id.clone(),
                    error: message.clone(),
                    timestamp: Utc::now(),
                });
            }
            NodeResult::Pause { callback_key, execution_data } => {
                tracing::info!(execution_id = %execution_id, node_id = %node.id, callback_key = %callback_key, "Node waiting for callback");
                node_record.status = NodeExecutionStatus::Waiting;
                node_record.execution_data = Some(execution_data.clone());
                self.emit_waiting(execution_id, &node.id, Some(callback_key.clone()));
            }
            NodeResult::Waiting { reason, execution_data } => {
                node_record.status = NodeExecutionStatus::Waiting;
                node_record.error_message = Some(reason.clone());
                node_record.execution_data = Some(execution_data.clone());
                self.emit_waiting(execution_id, &node.id, None);
            }
            NodeResult::Skipped { reason } => {
                tracing::info!(execution_id = %execution_id, node_id = %node.id, "Node skipped: {}", reason);
                node_record.error_message = Some(reason.clone());
                node_record.finish(NodeExecutionStatus::Skipped);
                self.event_bus.emit(ExecutionEvent::NodeSkipped {
                    execution_id,
                    node_id: node.id.clone(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.store.update_node_execution(&node_record).await?;
        Ok((result, node_record))
    }

    /// Finish the paused node with the delivered payload: its output becomes
    /// the stored execution data plus `callbackData`
    async fn complete_paused_node(
        &self,
        ctx: &mut ExecutionContext,
        node: &NodeSpec,
        data: Value,
    ) -> Result<Value, FlowError> {
        let node_record = self.store.latest_node_execution(ctx.execution_id(), &node.id).await?;
        let mut fields = node_record
            .as_ref()
            .and_then(|r| r.execution_data.as_ref())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        fields.insert("callbackData".to_string(), data);
        let output = Value::Object(fields);

        if let Some(mut node_record) = node_record {
            node_record.output_data = Some(output.clone());
            node_record.finish(NodeExecutionStatus::Completed);
            self.store.update_node_execution(&node_record).await?;
            // A node resumed directly leaves no reply outstanding
            if let Some(callback) = self.callbacks.for_node_execution(node_record.id).await? {
                self.callbacks.retire(&callback.callback_key).await?;
            }
        }
        self.event_bus.emit(ExecutionEvent::NodeCompleted {
            execution_id: ctx.execution_id(),
            node_id: node.id.clone(),
            output: output.clone(),
            duration_ms: 0,
            timestamp: Utc::now(),
        });
        apply_success(node, ctx, output.clone());
        Ok(output)
    }

    /// Pick up a callback that was claimed while this run was still pausing
    async fn take_early_callback(
        &self,
        record: &FlowExecutionRecord,
        callback_key: &str,
    ) -> Result<Option<(FlowExecutionRecord, Value)>, FlowError> {
        let Some(callback) = self.callbacks.get(callback_key).await? else {
            return Ok(None);
        };
        if callback.status != CallbackStatus::Received {
            return Ok(None);
        }
        if !self
            .store
            .transition_execution_at(record.id, &callback.node_id, ExecutionStatus::Paused, ExecutionStatus::Running)
            .await?
        {
            return Ok(None);
        }
        self.callbacks.mark_processed(callback_key).await?;
        tracing::info!(execution_id = %record.id, callback_key, "Callback arrived while pausing; continuing");

        let mut running = record.clone();
        running.status = ExecutionStatus::Running;
        Ok(Some((running, callback.callback_data.unwrap_or_default())))
    }

    /// Next node to run, `None` when the run should complete
    fn next_step(&self, node: &NodeSpec, ctx: &ExecutionContext, output: &Value) -> Result<Option<NodeId>, String> {
        if node.node_type == node_types::END {
            return Ok(None);
        }
        let edges: Vec<_> = ctx.graph().outgoing(&node.id).collect();

        if node.node_type == node_types::CONDITION {
            let handle = matched_handle(output);
            let next = edges
                .iter()
                .find(|edge| match edge.handle() {
                    Some(h) => h == handle,
                    None => handle == "true",
                })
                .map(|edge| edge.target.clone());
            if next.is_none() {
                tracing::debug!(node_id = %node.id, %handle, "No edge for matched branch");
            }
            return Ok(next);
        }

        match edges.as_slice() {
            [] => Ok(None),
            [edge] => Ok(Some(edge.target.clone())),
            many => Err(format!(
                "node {} has {} outgoing edges; only condition nodes may branch",
                node.id,
                many.len()
            )),
        }
    }

    async fn pause(
        &self,
        mut record: FlowExecutionRecord,
        ctx: &ExecutionContext,
        callback_key: Option<String>,
    ) -> Result<FlowExecutionRecord, FlowError> {
        record.status = ExecutionStatus::Paused;
        record.current_node_id = ctx.current_node_id().map(str::to_string);
        record.context_snapshot = Some(ctx.snapshot().to_value()?);
        self.store.update_execution(&record).await?;

        let node_id = record.current_node_id.clone().unwrap_or_default();
        tracing::info!(execution_id = %record.id, node_id = %node_id, "Workflow paused");
        self.event_bus.emit(ExecutionEvent::WorkflowPaused {
            execution_id: record.id,
            node_id,
            callback_key,
            timestamp: Utc::now(),
        });
        Ok(record)
    }

    async fn complete(
        &self,
        mut record: FlowExecutionRecord,
        ctx: ExecutionContext,
        last: &NodeSpec,
        last_output: Value,
    ) -> Result<FlowExecutionRecord, FlowError> {
        let output = if last.node_type == node_types::END {
            Value::Object(end_outputs(last, &ctx))
        } else {
            last_output
        };
        record.status = ExecutionStatus::Completed;
        record.output_data = Some(output);
        record.completed_at = Some(Utc::now());
        record.context_snapshot = Some(ctx.snapshot().to_value()?);
        self.store.update_execution(&record).await?;

        tracing::info!(execution_id = %record.id, flow_id = %record.flow_id, "Workflow completed");
        self.emit_finished(&record);
        Ok(record)
    }

    async fn fail(
        &self,
        mut record: FlowExecutionRecord,
        ctx: &ExecutionContext,
        message: String,
    ) -> Result<FlowExecutionRecord, FlowError> {
        tracing::error!(
            execution_id = %record.id,
            node_id = ?record.current_node_id,
            "Workflow failed: {}",
            message
        );
        record.status = ExecutionStatus::Failed;
        record.error_message = Some(message);
        record.completed_at = Some(Utc::now());
        record.context_snapshot = ctx.snapshot().to_value().ok();
        self.store.update_execution(&record).await?;
        self.emit_finished(&record);
        Ok(record)
    }

    fn emit_finished(&self, record: &FlowExecutionRecord) {
        let duration_ms = record
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id: record.id,
            status: record.status,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    fn emit_waiting(&self, execution_id: ExecutionId, node_id: &str, callback_key: Option<String>) {
        self.event_bus.emit(ExecutionEvent::NodeWaiting {
            execution_id,
            node_id: node_id.to_string(),
            callback_key,
            timestamp: Utc::now(),
        });
    }
}

/// Store a successful output, apply `outputAlias` and mark the node done
fn apply_success(node: &NodeSpec, ctx: &mut ExecutionContext, output: Value) {
    if let Some(alias) = node.config_str("outputAlias") {
        ctx.set_variable(alias, output.clone());
    }
    ctx.set_node_output(node.id.clone(), output);
    ctx.mark_completed(&node.id);
}

/// Branch handle chosen by a condition node; the legacy boolean `result`
/// maps to `"true"`/`"false"`
fn matched_handle(output: &Value) -> String {
    if let Some(handle) = output.get("matchedHandleId").and_then(Value::as_str) {
        return handle.to_string();
    }
    match output.get("result").map(Value::is_truthy) {
        Some(true) => "true".to_string(),
        _ => "false".to_string(),
    }
}

/// Evaluate an end node's declared `outputVariables` against the context
pub fn end_outputs(node: &NodeSpec, ctx: &ExecutionContext) -> Map {
    let resolver = ctx.resolver();
    let mut outputs = Map::new();
    for declared in node.config_array("outputVariables") {
        let name = declared.get("name").and_then(Value::as_str);
        let expression = declared.get("expression").and_then(Value::as_str);
        let (Some(name), Some(expression)) = (name, expression) else {
            continue;
        };
        let mut value = resolver.resolve(expression);
        if let Some(declared_type) = declared.get("type").and_then(Value::as_str) {
            value = value.coerce(declared_type);
        }
        outputs.insert(name.to_string(), value);
    }
    outputs
}

/// Fill inputs the caller did not supply from the start node's declared
/// `variables` defaults
fn apply_input_defaults(graph: &Graph, mut inputs: Map) -> Map {
    let Some(start) = graph.start_node() else {
        return inputs;
    };
    for declared in start.config_array("variables") {
        let Some(name) = declared.get("name").and_then(Value::as_str) else {
            continue;
        };
        let supplied = inputs.get(name).is_some_and(|v| !v.is_null());
        let default = declared.get("defaultValue").filter(|v| !v.is_null());
        if let (false, Some(default)) = (supplied, default) {
            let value = match declared.get("type").and_then(Value::as_str) {
                Some(declared_type) => default.clone().coerce(declared_type),
                None => default.clone(),
            };
            inputs.insert(name.to_string(), value);
        }
    }
    inputs
}
