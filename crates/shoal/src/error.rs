//! Error taxonomy for the orchestration core
//!
//! Structural errors (unknown pool, invalid transition) are returned to the
//! caller synchronously. Execution errors are reported per task and never
//! crash the core. [`OrchestratorError::is_retryable`] tells callers which
//! failures are worth backing off and trying again.

use std::time::Duration;

use thiserror::Error;

use crate::types::{PoolId, PoolState, TaskId};

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors produced by the orchestration core
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// State-machine misuse (caller bug, never retried)
    #[error("invalid transition for pool {pool_id}: cannot {operation} while {state}")]
    InvalidTransition {
        pool_id: PoolId,
        state: PoolState,
        operation: &'static str,
    },

    /// The circuit for `key` is open; the call was not attempted
    #[error("circuit open for {key}, retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// The backend ran the task and it failed
    #[error("task {task_id} failed on pool {pool_id}: {message}")]
    BackendExecution {
        pool_id: PoolId,
        task_id: TaskId,
        message: String,
    },

    /// Some result chunks did not reach the external store
    #[error("sync for pool {pool_id} partially failed: {failed_chunks} chunk(s), {failed_items} item(s)")]
    SyncPartialFailure {
        pool_id: PoolId,
        failed_chunks: usize,
        failed_items: usize,
    },

    /// The task deadline passed before the backend finished
    #[error("task {task_id} timed out after {elapsed:?}")]
    Timeout { task_id: TaskId, elapsed: Duration },

    /// No pool is registered under this id
    #[error("pool not found: {0}")]
    PoolNotFound(PoolId),

    /// The pool exists but is not accepting tasks
    #[error("pool {pool_id} is not accepting tasks (state: {state})")]
    PoolUnavailable { pool_id: PoolId, state: PoolState },

    /// A pool with this id is already registered
    #[error("pool already registered: {0}")]
    PoolAlreadyExists(PoolId),

    /// Every registered pool is closed, draining or initializing
    #[error("no routable pool available")]
    NoRoutablePool,

    /// The pool manager was shut down and takes no more tasks
    #[error("pool manager is shut down")]
    ShuttingDown,

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// External memory store failure
    #[error("memory store error: {0}")]
    Store(String),

    /// Local I/O failure (subprocess spawn, pipes)
    #[error("io error: {0}")]
    Io(String),

    /// Payload or result could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Whether a caller should back off and try again.
    ///
    /// Open circuits, timeouts and a momentarily empty routing table are
    /// transient. Backend failures are surfaced to the caller and structural
    /// errors are bugs, so neither is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::Timeout { .. } | Self::NoRoutablePool
        )
    }

    /// Whether this failure says something about the health of the target.
    ///
    /// Only these outcomes are counted by a circuit breaker.
    pub fn counts_against_target(&self) -> bool {
        matches!(
            self,
            Self::BackendExecution { .. } | Self::Timeout { .. } | Self::Io(_) | Self::Store(_)
        )
    }

    /// Short machine-readable error kind, used in bus events and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BackendExecution { .. } => "backend_execution",
            Self::SyncPartialFailure { .. } => "sync_partial_failure",
            Self::Timeout { .. } => "timeout",
            Self::PoolNotFound(_) => "pool_not_found",
            Self::PoolUnavailable { .. } => "pool_unavailable",
            Self::PoolAlreadyExists(_) => "pool_already_exists",
            Self::NoRoutablePool => "no_routable_pool",
            Self::ShuttingDown => "shutting_down",
            Self::Config(_) => "config",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
