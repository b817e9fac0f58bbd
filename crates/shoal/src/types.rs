//! Shared domain types: identifiers, tasks, pool and worker states, results

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, immutable pool identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PoolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task identifier (UUID v7, sortable by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Worker identifier, unique within its pool (index into the pool's arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Execution substrate of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process tokio tasks
    Local,
    /// A group of external processes
    Delegated,
    /// Jobs on a remotely scheduled cluster
    Cluster,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Delegated => write!(f, "delegated"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Pool lifecycle state
///
/// ```text
/// Initializing ──► Running ──► Scaling ──► Draining ──► Closed
///                     ▲           │
///                     └───────────┘
/// ```
///
/// Any non-terminal state may also jump straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Initializing,
    Running,
    Scaling,
    Draining,
    Closed,
}

impl PoolState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: PoolState) -> bool {
        use PoolState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Closed)
                | (Running, Scaling)
                | (Running, Draining)
                | (Running, Closed)
                | (Scaling, Running)
                | (Scaling, Draining)
                | (Scaling, Closed)
                | (Draining, Closed)
        )
    }

    /// Whether tasks may be started in this state
    pub fn accepts_tasks(self) -> bool {
        matches!(self, PoolState::Running | PoolState::Scaling)
    }

    pub fn is_terminal(self) -> bool {
        self == PoolState::Closed
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Scaling => write!(f, "scaling"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Failed,
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Opaque to the core; interpreted by the pool's adapter
    pub payload: serde_json::Value,
    /// Preferred pool, bypassing the routing strategy when it is running
    #[serde(default)]
    pub affinity: Option<PoolId>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            affinity: None,
            priority: 0,
            created_at: Utc::now(),
            deadline: None,
        }
    }

    pub fn with_affinity(mut self, pool_id: impl Into<PoolId>) -> Self {
        self.affinity = Some(pool_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline relative to now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let delta = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.deadline = Some(Utc::now() + delta);
        self
    }

    /// Time left until the deadline; `Some(ZERO)` if it already passed
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            deadline
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

/// Outcome of a successfully executed task, as held by the pool until collected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub pool_id: PoolId,
    pub worker_id: Option<WorkerId>,
    pub output: serde_json::Value,
    #[serde(with = "crate::config::duration_millis")]
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Stable reference used in `task.completed` events
    pub fn result_ref(&self) -> String {
        format!("{}/{}", self.pool_id, self.task_id)
    }
}

/// Results drained from one pool by `collect_results`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBatch {
    pub pool_id: PoolId,
    pub results: Vec<TaskResult>,
}

impl ResultBatch {
    pub fn empty(pool_id: PoolId) -> Self {
        Self {
            pool_id,
            results: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Point-in-time pool status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_id: PoolId,
    pub kind: BackendKind,
    pub state: PoolState,
    pub target_size: usize,
    pub worker_count: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub failed_workers: usize,
    /// Tasks accepted but not yet running (waiting for a slot or a remote scheduler)
    pub queue_depth: usize,
    pub in_flight: usize,
    /// Results held by the pool and not yet collected
    pub pending_results: usize,
    /// Mean of the recent duration window
    #[serde(with = "crate::config::option_duration_millis")]
    pub avg_task_duration: Option<Duration>,
}
