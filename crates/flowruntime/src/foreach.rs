use crate::engine::{FlowEngine, RunRequest};
use crate::subflow::{child_chain, flatten_outputs, map_inputs, upgrade};
use async_trait::async_trait;
use flowcore::{
    node_types, ExecutionContext, ExecutionStatus, Map, NodeError, NodeHandler, NodeMetadata, NodeResult,
    NodeSpec, Value,
};
use futures::future::join_all;
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serial,
    Parallel,
}

impl Mode {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("parallel") | Some("parallelStream") => Mode::Parallel,
            _ => Mode::Serial,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mode::Serial => "serial",
            Mode::Parallel => "parallel",
        }
    }
}

/// Result of one iteration's child run
#[derive(Debug, Clone)]
struct Iteration {
    index: usize,
    item: Value,
    execution_id: Option<String>,
    outcome: Result<Map, String>,
}

impl Iteration {
    fn to_value(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("index".to_string(), Value::from(self.index));
        fields.insert("item".to_string(), self.item.clone());
        fields.insert("success".to_string(), Value::from(self.outcome.is_ok()));
        if let Some(id) = &self.execution_id {
            fields.insert("executionId".to_string(), Value::from(id.as_str()));
        }
        match &self.outcome {
            Ok(output) => fields.insert("output".to_string(), Value::Object(output.clone())),
            Err(error) => fields.insert("error".to_string(), Value::from(error.as_str())),
        };
        Value::Object(fields)
    }
}

/// Runs a sub-workflow once per item of a collection, serially or with
/// bounded parallelism
pub struct ForEachHandler {
    engine: Weak<FlowEngine>,
    max_concurrency: usize,
}

impl ForEachHandler {
    pub fn new(engine: Weak<FlowEngine>, max_concurrency: usize) -> Self {
        Self {
            engine,
            max_concurrency: max_concurrency.max(1),
        }
    }
}

#[async_trait]
impl NodeHandler for ForEachHandler {
    fn node_type(&self) -> &str {
        node_types::FOR_EACH
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let engine = upgrade(&self.engine)?;
        let items_expression = node.require_config_str("itemsExpression")?;
        let subflow_id = node.require_config_str("subflowId")?.to_string();
        let mode = Mode::parse(node.config_str("mode"));
        let item_variable = node.config_str("itemVariable").unwrap_or("item").to_string();
        let index_variable = node.config_str("indexVariable").unwrap_or("index").to_string();
        let continue_on_error = node.config_bool("continueOnError");

        let chain = match child_chain(ctx, &subflow_id) {
            Ok(chain) => chain,
            Err(message) => return Ok(NodeResult::fail(message)),
        };
        let items = match normalize_items(ctx.resolver().resolve(items_expression)) {
            Ok(items) => items,
            Err(message) => return Ok(NodeResult::fail(message)),
        };
        if items.is_empty() {
            return Ok(NodeResult::success(summary(mode, &[])));
        }

        // Child requests are built up front so iterations never touch the
        // parent context concurrently
        let requests: Vec<RunRequest> = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let locals = Map::from([
                    (item_variable.clone(), item.clone()),
                    (index_variable.clone(), Value::from(index)),
                ]);
                let inputs = map_inputs(node, ctx, locals.clone(), Some(&locals));
                RunRequest::new(subflow_id.clone(), inputs)
                    .with_call_chain(chain.clone())
                    .with_parent(ctx.execution_id(), node.id.clone())
            })
            .collect();

        tracing::info!(
            execution_id = %ctx.execution_id(),
            node_id = %node.id,
            total = items.len(),
            mode = mode.as_str(),
            "Starting foreach iteration"
        );

        let total = items.len();
        let iterations = match mode {
            Mode::Serial => {
                let mut iterations = Vec::with_capacity(total);
                for (index, (item, request)) in items.into_iter().zip(requests).enumerate() {
                    let iteration = run_iteration(&engine, index, item, request).await;
                    ctx.progress(
                        ((index + 1) as f64 / total as f64) * 100.0,
                        Some(format!("{}/{} items", index + 1, total)),
                    );
                    if let (Err(error), false) = (&iteration.outcome, continue_on_error) {
                        return Ok(NodeResult::fail(format!("item {} failed: {}", index + 1, error)));
                    }
                    iterations.push(iteration);
                }
                iterations
            }
            Mode::Parallel => {
                let limit = node
                    .config("maxConcurrency")
                    .and_then(Value::as_i64)
                    .filter(|n| *n > 0)
                    .map(|n| n as usize)
                    .unwrap_or(self.max_concurrency);
                let iterations = run_parallel(&engine, items, requests, limit).await;
                ctx.progress(100.0, Some(format!("{}/{} items", total, total)));
                if !continue_on_error {
                    if let Some(Err(error)) = iterations.iter().map(|i| &i.outcome).find(|o| o.is_err()) {
                        return Ok(NodeResult::fail(format!("parallel execution has failed items: {}", error)));
                    }
                }
                iterations
            }
        };

        Ok(NodeResult::success(summary(mode, &iterations)))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Run a sub-workflow for every item of a collection", "flow")
    }
}

/// Items as a list: native arrays, JSON text holding an array, or null as empty
fn normalize_items(value: Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        Value::String(text) if text.trim().is_empty() => Ok(Vec::new()),
        Value::String(text) => match Value::from_json_str(&text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err("items must be an array".to_string()),
        },
        _ => Err("items must be an array".to_string()),
    }
}

async fn run_iteration(engine: &FlowEngine, index: usize, item: Value, request: RunRequest) -> Iteration {
    let (execution_id, outcome) = match engine.execute(request).await {
        Ok(record) => {
            let outcome = match record.status {
                ExecutionStatus::Completed => Ok(flatten_outputs(&record)),
                ExecutionStatus::Paused => Err("foreach does not support waiting subflows".to_string()),
                _ => Err(record.error_message.clone().unwrap_or_else(|| "unknown error".to_string())),
            };
            (Some(record.id.to_string()), outcome)
        }
        Err(e) => (None, Err(e.to_string())),
    };
    Iteration {
        index,
        item,
        execution_id,
        outcome,
    }
}

/// One task per item, at most `limit` running at once; results come back
/// in input order
async fn run_parallel(
    engine: &Arc<FlowEngine>,
    items: Vec<Value>,
    requests: Vec<RunRequest>,
    limit: usize,
) -> Vec<Iteration> {
    let semaphore = Arc::new(Semaphore::new(limit));
    let handles: Vec<_> = items
        .iter()
        .cloned()
        .zip(requests)
        .enumerate()
        .map(|(index, (item, request))| {
            let engine = engine.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_iteration(&engine, index, item, request).await
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(items)
        .enumerate()
        .map(|(index, (joined, item))| {
            joined.unwrap_or_else(|e| Iteration {
                index,
                item,
                execution_id: None,
                outcome: Err(format!("iteration task failed: {}", e)),
            })
        })
        .collect()
}

fn summary(mode: Mode, iterations: &[Iteration]) -> Value {
    let success_count = iterations.iter().filter(|i| i.outcome.is_ok()).count();
    Value::object([
        ("mode", Value::from(mode.as_str())),
        ("total", Value::from(iterations.len())),
        ("successCount", Value::from(success_count)),
        ("failedCount", Value::from(iterations.len() - success_count)),
        ("results", Value::Array(iterations.iter().map(Iteration::to_value).collect())),
    ])
}
