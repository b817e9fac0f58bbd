//! Per-pool execution
//!
//! A [`WorkerManager`] owns one pool's execution path:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     WorkerManager                        │
//! │                                                          │
//! │  execute(task)                                           │
//! │     │                                                    │
//! │     ▼                                                    │
//! │  CircuitBreaker (pool key) ── open ──► CircuitOpen       │
//! │     │                                                    │
//! │     ▼                                                    │
//! │  Semaphore (private, or one shared global limiter)       │
//! │     │                                                    │
//! │     ▼                                                    │
//! │  PoolBackend::execute  ── deadline ──► cancel + Timeout  │
//! │     │                                                    │
//! │     ▼                                                    │
//! │  release slot, then task.completed / task.failed         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! There is exactly one limiter on this path. A global cap replaces the
//! private semaphore instead of stacking on it.

mod manager;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use manager::WorkerManager;

/// WorkerManager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerManagerConfig {
    /// Deadline for tasks that carry none (`None` = unbounded)
    #[serde(with = "crate::config::option_duration_millis")]
    pub default_task_timeout: Option<Duration>,

    /// How long `drain` waits for in-flight tasks
    #[serde(with = "crate::config::duration_millis")]
    pub drain_timeout: Duration,
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerManagerConfig {
    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = Some(timeout);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
