//! Persistence boundary for execution state.
//!
//! The engine only needs the shape of the records plus two conditional
//! updates (callback claim and paused-run claim) that make resumption
//! exactly-once. Any backend offering compare-and-set semantics can
//! implement [`ExecutionStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    AsyncCallbackRecord, CallbackStatus, ExecutionId, ExecutionStatus, FlowExecutionRecord,
    NodeExecutionRecord, StoreError, Value,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, record: FlowExecutionRecord) -> Result<(), StoreError>;
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<FlowExecutionRecord>, StoreError>;
    async fn update_execution(&self, record: &FlowExecutionRecord) -> Result<(), StoreError>;

    /// Atomically move a run from `from` to `to`. Returns `false` when the
    /// run was not in `from`.
    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError>;

    /// [`ExecutionStore::transition_execution`] that also requires the run
    /// to be positioned at `node_id`
    async fn transition_execution_at(
        &self,
        id: ExecutionId,
        node_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError>;

    async fn list_executions(&self) -> Result<Vec<FlowExecutionRecord>, StoreError>;

    async fn insert_node_execution(&self, record: NodeExecutionRecord) -> Result<(), StoreError>;
    async fn update_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), StoreError>;
    async fn get_node_execution(&self, id: Uuid) -> Result<Option<NodeExecutionRecord>, StoreError>;

    /// Most recently started record for `node_id` within one run
    async fn latest_node_execution(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
    ) -> Result<Option<NodeExecutionRecord>, StoreError>;

    async fn node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecutionRecord>, StoreError>;

    async fn insert_callback(&self, record: AsyncCallbackRecord) -> Result<(), StoreError>;
    async fn get_callback(&self, key: &str) -> Result<Option<AsyncCallbackRecord>, StoreError>;

    /// The callback registered for one node execution, if any
    async fn callback_for_node_execution(
        &self,
        node_execution_id: Uuid,
    ) -> Result<Option<AsyncCallbackRecord>, StoreError>;

    /// Atomically move a callback from waiting to received, attaching the
    /// payload. Returns `None` when it was not waiting.
    async fn claim_callback(
        &self,
        key: &str,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<AsyncCallbackRecord>, StoreError>;

    /// Conditional status change; returns `false` when the current status
    /// differs from `from`
    async fn set_callback_status(
        &self,
        key: &str,
        from: CallbackStatus,
        to: CallbackStatus,
    ) -> Result<bool, StoreError>;

    /// Waiting callbacks whose expiry is at or before `now`
    async fn expired_callbacks(&self, now: DateTime<Utc>) -> Result<Vec<AsyncCallbackRecord>, StoreError>;
}

#[derive(Default)]
struct Tables {
    executions: HashMap<ExecutionId, FlowExecutionRecord>,
    node_executions: HashMap<Uuid, NodeExecutionRecord>,
    callbacks: HashMap<String, AsyncCallbackRecord>,
}

/// In-process store backed by a single lock, so every conditional update is
/// atomic with respect to the others
#[derive(Default)]
pub struct InMemoryExecutionStore {
    tables: RwLock<Tables>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert_execution(&self, record: FlowExecutionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.executions.contains_key(&record.id) {
            return Err(StoreError::Duplicate {
                kind: "execution",
                id: record.id.to_string(),
            });
        }
        tables.executions.insert(record.id, record);
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<FlowExecutionRecord>, StoreError> {
        Ok(self.tables.read().await.executions.get(&id).cloned())
    }

    async fn update_execution(&self, record: &FlowExecutionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .executions
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::not_found("execution", record.id.to_string()))?;
        *slot = record.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("execution", id.to_string()))?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition_execution_at(
        &self,
        id: ExecutionId,
        node_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("execution", id.to_string()))?;
        if record.status != from || record.current_node_id.as_deref() != Some(node_id) {
            return Ok(false);
        }
        record.status = to;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_executions(&self) -> Result<Vec<FlowExecutionRecord>, StoreError> {
        let mut records: Vec<_> = self.tables.read().await.executions.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn insert_node_execution(&self, record: NodeExecutionRecord) -> Result<(), StoreError> {
        self.tables.write().await.node_executions.insert(record.id, record);
        Ok(())
    }

    async fn update_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .node_executions
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::not_found("node execution", record.id.to_string()))?;
        *slot = record.clone();
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> Result<Option<NodeExecutionRecord>, StoreError> {
        Ok(self.tables.read().await.node_executions.get(&id).cloned())
    }

    async fn latest_node_execution(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
    ) -> Result<Option<NodeExecutionRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .node_executions
            .values()
            .filter(|r| r.execution_id == execution_id && r.node_id == node_id)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .tables
            .read()
            .await
            .node_executions
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn insert_callback(&self, record: AsyncCallbackRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.callbacks.contains_key(&record.callback_key) {
            return Err(StoreError::Duplicate {
                kind: "callback",
                id: record.callback_key,
            });
        }
        tables.callbacks.insert(record.callback_key.clone(), record);
        Ok(())
    }

    async fn get_callback(&self, key: &str) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        Ok(self.tables.read().await.callbacks.get(key).cloned())
    }

    async fn callback_for_node_execution(
        &self,
        node_execution_id: Uuid,
    ) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .callbacks
            .values()
            .find(|c| c.node_execution_id == node_execution_id)
            .cloned())
    }

    async fn claim_callback(
        &self,
        key: &str,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.callbacks.get_mut(key) else {
            return Ok(None);
        };
        if record.status != CallbackStatus::Waiting {
            return Ok(None);
        }
        record.status = CallbackStatus::Received;
        record.callback_data = Some(data);
        record.received_at = Some(now);
        Ok(Some(record.clone()))
    }

    async fn set_callback_status(
        &self,
        key: &str,
        from: CallbackStatus,
        to: CallbackStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .callbacks
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found("callback", key))?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        Ok(true)
    }

    async fn expired_callbacks(&self, now: DateTime<Utc>) -> Result<Vec<AsyncCallbackRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .callbacks
            .values()
            .filter(|c| c.status == CallbackStatus::Waiting && c.is_expired_at(now))
            .cloned()
            .collect())
    }
}
