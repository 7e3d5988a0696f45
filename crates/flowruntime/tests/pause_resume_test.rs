mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::*;
use flowcore::{
    AsyncCallbackRecord, CallbackStatus, ExecutionId, ExecutionStatus, FlowExecutionRecord, NodeExecutionRecord,
    NodeExecutionStatus, NodeSpec, StoreError, Value,
};
use flowruntime::{
    CallbackOutcome, ExecutionStore, ExpiredCallbackPolicy, FlowEngine, FlowRuntime, InMemoryExecutionStore,
    RuntimeConfig,
};
use serde_json::json;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use uuid::Uuid;

async fn waiting_flow(rt: &FlowRuntime, key: &str) {
    rt.register_flow(linear(
        "approval",
        vec![NodeSpec::new("wait", "wait").with_config("key", key)],
        end_node(json!([
            {"name": "answer", "expression": "{{nodes.wait.callbackData.answer}}"},
            {"name": "request", "expression": "{{nodes.wait.requestId}}"}
        ])),
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn callback_resumes_paused_run() {
    let rt = runtime();
    waiting_flow(&rt, "cb-1").await;

    let paused = rt.execute("approval", None, Default::default()).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.current_node_id.as_deref(), Some("wait"));
    assert!(paused.context_snapshot.is_some());

    let callback = rt.get_callback("cb-1").await.unwrap().unwrap();
    assert_eq!(callback.status, CallbackStatus::Waiting);
    assert_eq!(callback.execution_id, paused.id);

    let outcome = rt
        .handle_callback("cb-1", Value::from(json!({"answer": "yes"})))
        .await
        .unwrap();
    let CallbackOutcome::Resumed(finished) = outcome else {
        panic!("expected the run to resume, got {:?}", outcome);
    };
    assert_eq!(finished.id, paused.id);
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(
        finished.output_data,
        Some(Value::from(json!({"answer": "yes", "request": "r-1"})))
    );

    let callback = rt.get_callback("cb-1").await.unwrap().unwrap();
    assert_eq!(callback.status, CallbackStatus::Processed);

    let wait = rt
        .node_executions(paused.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_id == "wait")
        .unwrap();
    assert_eq!(wait.status, NodeExecutionStatus::Completed);
}

#[tokio::test]
async fn duplicate_callback_is_ignored() {
    let rt = runtime();
    waiting_flow(&rt, "cb-dup").await;
    rt.execute("approval", None, Default::default()).await.unwrap();

    let first = rt.handle_callback("cb-dup", Value::from(json!({"answer": 1}))).await.unwrap();
    assert!(matches!(first, CallbackOutcome::Resumed(_)));

    let second = rt.handle_callback("cb-dup", Value::from(json!({"answer": 2}))).await.unwrap();
    assert!(matches!(second, CallbackOutcome::Ignored(CallbackStatus::Processed)));
}

#[tokio::test]
async fn unknown_callback_key_errors() {
    let rt = runtime();
    assert!(rt.handle_callback("missing", Value::Null).await.is_err());
}

#[tokio::test]
async fn resume_is_a_noop_unless_paused() {
    let rt = runtime();
    rt.register_flow(linear("plain", vec![], end_node(json!([])))).await.unwrap();
    let done = rt.execute("plain", None, Default::default()).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);

    assert!(rt.resume(done.id, Value::Null).await.unwrap().is_none());
}

#[tokio::test]
async fn direct_resume_continues_from_paused_node() {
    let rt = runtime();
    waiting_flow(&rt, "cb-direct").await;
    let paused = rt.execute("approval", None, Default::default()).await.unwrap();

    let resumed = rt
        .resume(paused.id, Value::from(json!({"answer": "direct"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(
        resumed.output_data.as_ref().and_then(|o| o.get("answer")),
        Some(&Value::from("direct"))
    );
    assert!(rt.resume(paused.id, Value::Null).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_callbacks_resume_exactly_once() {
    let rt = runtime();
    waiting_flow(&rt, "cb-race").await;
    let paused = rt.execute("approval", None, Default::default()).await.unwrap();

    let (a, b) = tokio::join!(
        rt.handle_callback("cb-race", Value::from(json!({"answer": "a"}))),
        rt.handle_callback("cb-race", Value::from(json!({"answer": "b"}))),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let resumed = outcomes
        .iter()
        .filter(|o| matches!(o, CallbackOutcome::Resumed(_)))
        .count();
    let ignored = outcomes
        .iter()
        .filter(|o| matches!(o, CallbackOutcome::Ignored(_)))
        .count();
    assert_eq!((resumed, ignored), (1, 1));

    let record = rt.get_execution(paused.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    let end_runs = rt
        .node_executions(paused.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.node_id == "end")
        .count();
    assert_eq!(end_runs, 1);
}

#[tokio::test]
async fn expired_callback_keeps_run_paused_by_default() {
    let rt = runtime_with(RuntimeConfig {
        callback_ttl: Duration::ZERO,
        ..RuntimeConfig::default()
    });
    waiting_flow(&rt, "cb-late").await;
    let paused = rt.execute("approval", None, Default::default()).await.unwrap();

    let outcome = rt.handle_callback("cb-late", Value::Null).await.unwrap();
    assert!(matches!(outcome, CallbackOutcome::Expired));

    let record = rt.get_execution(paused.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Paused);
    let callback = rt.get_callback("cb-late").await.unwrap().unwrap();
    assert_eq!(callback.status, CallbackStatus::Expired);

    let again = rt.handle_callback("cb-late", Value::Null).await.unwrap();
    assert!(matches!(again, CallbackOutcome::Ignored(CallbackStatus::Expired)));
}

#[tokio::test]
async fn expiry_sweep_can_fail_the_run() {
    let rt = runtime_with(RuntimeConfig {
        callback_ttl: Duration::ZERO,
        expired_callback_policy: ExpiredCallbackPolicy::FailExecution,
        ..RuntimeConfig::default()
    });
    waiting_flow(&rt, "cb-sweep").await;
    let paused = rt.execute("approval", None, Default::default()).await.unwrap();

    let expired = rt.expire_callbacks().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].callback_key, "cb-sweep");

    let record = rt.get_execution(paused.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("callback cb-sweep expired"));

    let wait = rt
        .node_executions(paused.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_id == "wait")
        .unwrap();
    assert_eq!(wait.status, NodeExecutionStatus::Failed);
}

/// `start -> first(k1) -> second(k2) -> end`
async fn two_step_flow(rt: &FlowRuntime) {
    rt.register_flow(linear(
        "review",
        vec![
            NodeSpec::new("first", "wait").with_config("key", "k1"),
            NodeSpec::new("second", "wait").with_config("key", "k2"),
        ],
        end_node(json!([{"name": "second", "expression": "{{nodes.second.callbackData.from}}"}])),
    ))
    .await
    .unwrap();
}

async fn callback_status(rt: &FlowRuntime, key: &str) -> CallbackStatus {
    rt.get_callback(key).await.unwrap().unwrap().status
}

/// Pause at `first`, then resume it directly so the run waits at `second`
async fn paused_at_second(rt: &FlowRuntime) -> ExecutionId {
    two_step_flow(rt).await;
    let paused = rt.execute("review", None, Default::default()).await.unwrap();
    assert_eq!(paused.current_node_id.as_deref(), Some("first"));

    let moved = rt
        .resume(paused.id, Value::from(json!({"from": "direct"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.status, ExecutionStatus::Paused);
    assert_eq!(moved.current_node_id.as_deref(), Some("second"));
    paused.id
}

#[tokio::test]
async fn direct_resume_retires_the_nodes_callback() {
    let rt = runtime();
    let id = paused_at_second(&rt).await;
    assert_eq!(callback_status(&rt, "k1").await, CallbackStatus::Processed);
    assert_eq!(callback_status(&rt, "k2").await, CallbackStatus::Waiting);

    let stale = rt.handle_callback("k1", Value::from(json!({"from": "stale"}))).await.unwrap();
    assert!(matches!(stale, CallbackOutcome::Ignored(CallbackStatus::Processed)));
    let record = rt.get_execution(id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Paused);
    assert_eq!(record.current_node_id.as_deref(), Some("second"));

    let outcome = rt.handle_callback("k2", Value::from(json!({"from": "k2"}))).await.unwrap();
    let CallbackOutcome::Resumed(finished) = outcome else {
        panic!("expected resume, got {:?}", outcome);
    };
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.output_data, Some(Value::from(json!({"second": "k2"}))));
}

#[tokio::test]
async fn reply_for_another_node_does_not_resume_the_run() {
    let rt = runtime();
    let id = paused_at_second(&rt).await;
    // A backend that never retired the first callback
    rt.engine()
        .store()
        .set_callback_status("k1", CallbackStatus::Processed, CallbackStatus::Waiting)
        .await
        .unwrap();

    let outcome = rt.handle_callback("k1", Value::from(json!({"from": "stale"}))).await.unwrap();
    assert!(matches!(outcome, CallbackOutcome::Ignored(CallbackStatus::Processed)));
    assert_eq!(callback_status(&rt, "k1").await, CallbackStatus::Processed);
    assert_eq!(callback_status(&rt, "k2").await, CallbackStatus::Waiting);

    let record = rt.get_execution(id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Paused);
    assert_eq!(record.current_node_id.as_deref(), Some("second"));
}

#[tokio::test]
async fn expiry_of_another_nodes_callback_keeps_the_run() {
    let rt = runtime_with(RuntimeConfig {
        callback_ttl: Duration::ZERO,
        expired_callback_policy: ExpiredCallbackPolicy::FailExecution,
        ..RuntimeConfig::default()
    });
    let id = paused_at_second(&rt).await;
    rt.engine()
        .store()
        .set_callback_status("k1", CallbackStatus::Processed, CallbackStatus::Waiting)
        .await
        .unwrap();

    let outcome = rt.handle_callback("k1", Value::Null).await.unwrap();
    assert!(matches!(outcome, CallbackOutcome::Expired));

    let record = rt.get_execution(id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Paused);
    assert_eq!(record.error_message, None);
}

/// Delivers a reply for `key` from inside `insert_callback`, while the
/// traversal that registered it has not yet stored the run as paused
struct EarlyReplyStore {
    inner: InMemoryExecutionStore,
    key: &'static str,
    engine: OnceLock<Weak<FlowEngine>>,
    outcome: Mutex<Option<CallbackOutcome>>,
}

impl EarlyReplyStore {
    fn new(key: &'static str) -> Self {
        Self {
            inner: InMemoryExecutionStore::new(),
            key,
            engine: OnceLock::new(),
            outcome: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ExecutionStore for EarlyReplyStore {
    async fn insert_execution(&self, record: FlowExecutionRecord) -> Result<(), StoreError> {
        self.inner.insert_execution(record).await
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<FlowExecutionRecord>, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn update_execution(&self, record: &FlowExecutionRecord) -> Result<(), StoreError> {
        self.inner.update_execution(record).await
    }

    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        self.inner.transition_execution(id, from, to).await
    }

    async fn transition_execution_at(
        &self,
        id: ExecutionId,
        node_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        self.inner.transition_execution_at(id, node_id, from, to).await
    }

    async fn list_executions(&self) -> Result<Vec<FlowExecutionRecord>, StoreError> {
        self.inner.list_executions().await
    }

    async fn insert_node_execution(&self, record: NodeExecutionRecord) -> Result<(), StoreError> {
        self.inner.insert_node_execution(record).await
    }

    async fn update_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), StoreError> {
        self.inner.update_node_execution(record).await
    }

    async fn get_node_execution(&self, id: Uuid) -> Result<Option<NodeExecutionRecord>, StoreError> {
        self.inner.get_node_execution(id).await
    }

    async fn latest_node_execution(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
    ) -> Result<Option<NodeExecutionRecord>, StoreError> {
        self.inner.latest_node_execution(execution_id, node_id).await
    }

    async fn node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        self.inner.node_executions(execution_id).await
    }

    async fn insert_callback(&self, record: AsyncCallbackRecord) -> Result<(), StoreError> {
        let key = record.callback_key.clone();
        self.inner.insert_callback(record).await?;
        if key == self.key {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                let outcome = engine
                    .handle_callback(&key, Value::from(json!({"answer": "early"})))
                    .await
                    .unwrap();
                *self.outcome.lock().unwrap() = Some(outcome);
            }
        }
        Ok(())
    }

    async fn get_callback(&self, key: &str) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        self.inner.get_callback(key).await
    }

    async fn callback_for_node_execution(
        &self,
        node_execution_id: Uuid,
    ) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        self.inner.callback_for_node_execution(node_execution_id).await
    }

    async fn claim_callback(
        &self,
        key: &str,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        self.inner.claim_callback(key, data, now).await
    }

    async fn set_callback_status(
        &self,
        key: &str,
        from: CallbackStatus,
        to: CallbackStatus,
    ) -> Result<bool, StoreError> {
        self.inner.set_callback_status(key, from, to).await
    }

    async fn expired_callbacks(&self, now: DateTime<Utc>) -> Result<Vec<AsyncCallbackRecord>, StoreError> {
        self.inner.expired_callbacks(now).await
    }
}

#[tokio::test]
async fn reply_during_pause_is_picked_up_by_the_pausing_run() {
    init_tracing();
    let store = Arc::new(EarlyReplyStore::new("cb-early"));
    let rt = FlowRuntime::with_store(registry(), store.clone(), RuntimeConfig::default());
    assert!(store.engine.set(Arc::downgrade(rt.engine())).is_ok());
    waiting_flow(&rt, "cb-early").await;

    let record = rt.execute("approval", None, Default::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(
        record.output_data,
        Some(Value::from(json!({"answer": "early", "request": "r-1"})))
    );

    let outcome = store.outcome.lock().unwrap().take();
    assert!(matches!(outcome, Some(CallbackOutcome::Deferred)), "got {:?}", outcome);
    assert_eq!(callback_status(&rt, "cb-early").await, CallbackStatus::Processed);

    let nodes = rt.node_executions(record.id).await.unwrap();
    assert_eq!(nodes.iter().filter(|n| n.node_id == "end").count(), 1);
    let wait = nodes.iter().find(|n| n.node_id == "wait").unwrap();
    assert_eq!(wait.status, NodeExecutionStatus::Completed);

    let again = rt.handle_callback("cb-early", Value::Null).await.unwrap();
    assert!(matches!(again, CallbackOutcome::Ignored(CallbackStatus::Processed)));
}

#[tokio::test]
async fn large_integer_ids_survive_pause_and_resume() {
    let rt = runtime();
    rt.register_flow(linear(
        "orders",
        vec![NodeSpec::new("wait", "wait").with_config("key", "cb-order")],
        end_node(json!([
            {"name": "id", "expression": "{{input.orderId}}"},
            {"name": "next", "expression": "{{nodes.wait.callbackData.next}}"}
        ])),
    ))
    .await
    .unwrap();

    let paused = rt
        .execute("orders", None, json_map(json!({"orderId": 9007199254740993_i64})))
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);

    let outcome = rt
        .handle_callback("cb-order", Value::from(json!({"next": 9007199254740995_i64})))
        .await
        .unwrap();
    let CallbackOutcome::Resumed(finished) = outcome else {
        panic!("expected resume, got {:?}", outcome);
    };
    let output = finished.output_data.unwrap();
    assert_eq!(output.get("id").and_then(Value::as_i64), Some(9_007_199_254_740_993));
    assert_eq!(output.get("next").and_then(Value::as_i64), Some(9_007_199_254_740_995));
    assert_eq!(
        serde_json::to_string(&output).unwrap(),
        r#"{"id":9007199254740993,"next":9007199254740995}"#
    );
}
