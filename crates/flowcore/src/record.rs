//! Durable records written by the engine: one per run, one per node
//! execution and one per pending asynchronous callback.

use crate::events::ExecutionId;
use crate::value::Value;
use crate::workflow::{FlowId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecutionRecord {
    pub id: ExecutionId,
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub status: ExecutionStatus,
    pub current_node_id: Option<NodeId>,
    pub context_snapshot: Option<Value>,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
    pub parent_node_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowExecutionRecord {
    pub fn new(flow_id: impl Into<FlowId>, flow_version: u32, input_data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_id: flow_id.into(),
            flow_version,
            status: ExecutionStatus::Pending,
            current_node_id: None,
            context_snapshot: None,
            input_data,
            output_data: None,
            error_message: None,
            parent_execution_id: None,
            parent_node_id: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_parent(mut self, execution_id: ExecutionId, node_id: impl Into<NodeId>) -> Self {
        self.parent_execution_id = Some(execution_id);
        self.parent_node_id = Some(node_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeExecutionStatus {
    Running,
    Completed,
    Failed,
    Waiting,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_type: String,
    pub node_label: Option<String>,
    pub status: NodeExecutionStatus,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub execution_data: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRecord {
    pub fn running(execution_id: ExecutionId, node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            node_label: None,
            status: NodeExecutionStatus::Running,
            input_data: None,
            output_data: None,
            error_message: None,
            execution_data: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn finish(&mut self, status: NodeExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Waiting,
    Received,
    Expired,
    Processed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncCallbackRecord {
    pub callback_key: String,
    pub execution_id: ExecutionId,
    pub node_execution_id: Uuid,
    pub node_id: NodeId,
    pub status: CallbackStatus,
    pub topic: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub callback_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
}

impl AsyncCallbackRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
