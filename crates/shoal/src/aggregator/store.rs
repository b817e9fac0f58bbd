// External memory store contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{PoolId, TaskId, TaskResult};

/// One task result as persisted in the external store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Stable id (`{pool_id}/{task_id}`); the store acknowledges items by it
    pub id: String,
    pub pool_id: PoolId,
    pub task_id: TaskId,
    pub content: serde_json::Value,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl From<TaskResult> for MemoryItem {
    fn from(result: TaskResult) -> Self {
        Self {
            id: result.result_ref(),
            pool_id: result.pool_id,
            task_id: result.task_id,
            content: result.output,
            duration_ms: result.duration.as_millis() as u64,
            created_at: result.completed_at,
        }
    }
}

/// Ids the store accepted from one `batch_store` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub stored_ids: Vec<String>,
}

/// External memory store.
///
/// Called once per chunk. A successful call may still acknowledge only some
/// of the items; the rest are resent on a later cycle, so stores must treat
/// `id` as an idempotency key.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn batch_store(&self, items: Vec<MemoryItem>) -> Result<StoreReceipt>;

    fn name(&self) -> &'static str {
        "MemoryStore"
    }
}
