// Bus messages
//
// Topics are dotted names; each message variant belongs to exactly one topic.

use serde::{Deserialize, Serialize};

use crate::types::{PoolId, PoolState, TaskId};

/// A pool moved between lifecycle states
pub const POOL_LIFECYCLE_CHANGED: &str = "pool.lifecycle.changed";

/// A task finished and its result is collectable
pub const TASK_COMPLETED: &str = "task.completed";

/// A task failed or timed out
pub const TASK_FAILED: &str = "task.failed";

/// Message carried by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BusMessage {
    #[serde(rename = "pool.lifecycle.changed")]
    PoolLifecycleChanged {
        pool_id: PoolId,
        old_state: PoolState,
        new_state: PoolState,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted {
        pool_id: PoolId,
        task_id: TaskId,
        /// `{pool_id}/{task_id}`; resolvable through the pool's results
        result_ref: String,
    },

    #[serde(rename = "task.failed")]
    TaskFailed {
        pool_id: PoolId,
        task_id: TaskId,
        error: String,
        /// Machine-readable error kind, e.g. `timeout` or `backend_execution`
        error_kind: String,
    },
}

impl BusMessage {
    /// Topic this message is published on
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PoolLifecycleChanged { .. } => POOL_LIFECYCLE_CHANGED,
            Self::TaskCompleted { .. } => TASK_COMPLETED,
            Self::TaskFailed { .. } => TASK_FAILED,
        }
    }

    pub fn pool_id(&self) -> &PoolId {
        match self {
            Self::PoolLifecycleChanged { pool_id, .. }
            | Self::TaskCompleted { pool_id, .. }
            | Self::TaskFailed { pool_id, .. } => pool_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let msg = BusMessage::PoolLifecycleChanged {
            pool_id: PoolId::from("gpu"),
            old_state: PoolState::Running,
            new_state: PoolState::Draining,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "pool.lifecycle.changed");
        assert_eq!(json["data"]["old_state"], "running");
        assert_eq!(json["data"]["new_state"], "draining");
        assert_eq!(msg.topic(), POOL_LIFECYCLE_CHANGED);
    }

    #[test]
    fn test_topic_matches_tag() {
        let msg = BusMessage::TaskFailed {
            pool_id: PoolId::from("cpu"),
            task_id: TaskId::new(),
            error: "boom".into(),
            error_kind: "backend_execution".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.topic());
        assert_eq!(msg.pool_id().as_str(), "cpu");
    }
}
