use crate::store::ExecutionStore;
use chrono::{DateTime, Duration, Utc};
use flowcore::{
    AsyncCallbackRecord, CallbackStatus, ExecutionId, FlowError, FlowExecutionRecord, NodeId, StoreError, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// What happens to a paused run whose callback expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredCallbackPolicy {
    /// Mark the callback expired and leave the run paused
    #[default]
    KeepPaused,
    /// Mark the callback expired and fail the run
    FailExecution,
}

/// Result of presenting a callback payload
#[derive(Debug, Clone)]
pub enum CallbackClaim {
    /// This caller won the claim and must resume the run
    Claimed(AsyncCallbackRecord),
    /// The callback was already received, processed or expired
    AlreadyHandled(CallbackStatus),
    /// The callback was still waiting but past its expiry
    Expired(AsyncCallbackRecord),
}

/// What a presented callback led to
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// The paused run was resumed and ran to its next stop
    Resumed(FlowExecutionRecord),
    /// Claimed, but the run had not finished pausing; it resumes itself
    Deferred,
    /// Duplicate or late delivery; nothing happened
    Ignored(CallbackStatus),
    /// The callback had expired
    Expired,
}

/// Durable registry of pending asynchronous replies keyed by callback token
#[derive(Clone)]
pub struct AsyncCallbackRegistry {
    store: Arc<dyn ExecutionStore>,
    ttl: Duration,
}

impl AsyncCallbackRegistry {
    pub fn new(store: Arc<dyn ExecutionStore>, ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(24));
        Self { store, ttl }
    }

    /// Record a waiting callback for a paused node
    pub async fn register(
        &self,
        callback_key: &str,
        execution_id: ExecutionId,
        node_execution_id: Uuid,
        node_id: &NodeId,
        topic: Option<String>,
    ) -> Result<AsyncCallbackRecord, StoreError> {
        let now = Utc::now();
        let record = AsyncCallbackRecord {
            callback_key: callback_key.to_string(),
            execution_id,
            node_execution_id,
            node_id: node_id.clone(),
            status: CallbackStatus::Waiting,
            topic,
            expires_at: now + self.ttl,
            callback_data: None,
            created_at: now,
            received_at: None,
        };
        self.store.insert_callback(record.clone()).await?;
        tracing::info!(callback_key, execution_id = %execution_id, node_id = %node_id, "Registered async callback");
        Ok(record)
    }

    pub async fn get(&self, callback_key: &str) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        self.store.get_callback(callback_key).await
    }

    /// Claim a waiting callback. Exactly one concurrent caller gets
    /// [`CallbackClaim::Claimed`] for a given key.
    pub async fn claim(&self, callback_key: &str, data: Value) -> Result<CallbackClaim, FlowError> {
        let now = Utc::now();
        let record = self
            .store
            .get_callback(callback_key)
            .await?
            .ok_or_else(|| FlowError::CallbackNotFound(callback_key.to_string()))?;

        if record.status != CallbackStatus::Waiting {
            return Ok(CallbackClaim::AlreadyHandled(record.status));
        }
        if record.is_expired_at(now) {
            return Ok(match self.expire(callback_key).await? {
                true => CallbackClaim::Expired(record),
                false => CallbackClaim::AlreadyHandled(CallbackStatus::Expired),
            });
        }

        match self.store.claim_callback(callback_key, data, now).await? {
            Some(claimed) => Ok(CallbackClaim::Claimed(claimed)),
            None => {
                let status = self
                    .store
                    .get_callback(callback_key)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or(CallbackStatus::Received);
                Ok(CallbackClaim::AlreadyHandled(status))
            }
        }
    }

    /// Received -> processed once the run has been resumed
    pub async fn mark_processed(&self, callback_key: &str) -> Result<bool, StoreError> {
        self.store
            .set_callback_status(callback_key, CallbackStatus::Received, CallbackStatus::Processed)
            .await
    }

    /// Retire the callback of a node that has been resumed, whether or not
    /// its reply arrived. Returns `false` when it was already retired.
    pub async fn retire(&self, callback_key: &str) -> Result<bool, StoreError> {
        for from in [CallbackStatus::Waiting, CallbackStatus::Received] {
            if self
                .store
                .set_callback_status(callback_key, from, CallbackStatus::Processed)
                .await?
            {
                tracing::debug!(callback_key, ?from, "Async callback retired");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Callback registered for a paused node execution
    pub async fn for_node_execution(&self, node_execution_id: Uuid) -> Result<Option<AsyncCallbackRecord>, StoreError> {
        self.store.callback_for_node_execution(node_execution_id).await
    }

    /// Waiting -> expired; `false` when another caller got there first
    pub async fn expire(&self, callback_key: &str) -> Result<bool, StoreError> {
        let expired = self
            .store
            .set_callback_status(callback_key, CallbackStatus::Waiting, CallbackStatus::Expired)
            .await?;
        if expired {
            tracing::warn!(callback_key, "Async callback expired");
        }
        Ok(expired)
    }

    /// Expire every waiting callback past its deadline, returning the ones
    /// this call transitioned
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<AsyncCallbackRecord>, StoreError> {
        let mut expired = Vec::new();
        for record in self.store.expired_callbacks(now).await? {
            if self.expire(&record.callback_key).await? {
                expired.push(record);
            }
        }
        Ok(expired)
    }
}
