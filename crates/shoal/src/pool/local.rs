//! In-process pool: each execution runs on its own tokio task

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{PoolBackend, PoolRuntime};
use crate::error::{OrchestratorError, Result};
use crate::types::{Task, TaskId, TaskResult};

/// Work performed by a local pool.
///
/// The core treats the payload as opaque; the executor interprets it.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &Task) -> anyhow::Result<serde_json::Value>;
}

pub struct LocalPool {
    runtime: PoolRuntime,
    executor: Arc<dyn TaskExecutor>,
    running: Mutex<HashMap<TaskId, AbortHandle>>,
}

impl LocalPool {
    pub fn new(runtime: PoolRuntime, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            runtime,
            executor,
            running: Mutex::new(HashMap::new()),
        }
    }
}

/// Aborts the spawned task when the execution is dropped
struct Running<'a> {
    running: &'a Mutex<HashMap<TaskId, AbortHandle>>,
    task_id: TaskId,
    abort: AbortHandle,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.abort.abort();
        self.running.lock().remove(&self.task_id);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl PoolBackend for LocalPool {
    fn runtime(&self) -> &PoolRuntime {
        &self.runtime
    }

    async fn execute(&self, task: Task) -> Result<TaskResult> {
        let lease = self.runtime.checkout(task.id)?;
        let task_id = task.id;
        let pool_id = self.runtime.pool_id().clone();
        let started = Instant::now();

        let executor = Arc::clone(&self.executor);
        let handle = tokio::spawn(async move { executor.execute(&task).await });
        let abort = handle.abort_handle();
        self.running.lock().insert(task_id, abort.clone());
        let guard = Running {
            running: &self.running,
            task_id,
            abort,
        };

        let joined = handle.await;
        drop(guard);

        match joined {
            Ok(Ok(output)) => {
                let result = TaskResult {
                    task_id,
                    pool_id,
                    worker_id: lease.worker_id(),
                    output,
                    duration: started.elapsed(),
                    completed_at: Utc::now(),
                };
                self.runtime.record_result(result.clone());
                lease.complete();
                Ok(result)
            }
            Ok(Err(e)) => {
                lease.complete();
                Err(OrchestratorError::BackendExecution {
                    pool_id,
                    task_id,
                    message: format!("{e:#}"),
                })
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                warn!(pool_id = %pool_id, task_id = %task_id, panic = %message, "Task panicked");
                lease.fail();
                Err(OrchestratorError::BackendExecution {
                    pool_id,
                    task_id,
                    message: format!("worker panicked: {message}"),
                })
            }
            Err(_) => {
                lease.complete();
                Err(OrchestratorError::BackendExecution {
                    pool_id,
                    task_id,
                    message: "task cancelled".into(),
                })
            }
        }
    }

    async fn cancel(&self, task_id: TaskId) {
        if let Some(abort) = self.running.lock().get(&task_id) {
            debug!(pool_id = %self.runtime.pool_id(), task_id = %task_id, "Aborting local task");
            abort.abort();
        }
    }

    async fn close(&self) -> Result<()> {
        self.runtime.close()?;
        for (_, abort) in self.running.lock().drain() {
            abort.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OrchestratorMetrics;
    use crate::pool::{spawn_pool, PoolSpec};
    use crate::types::PoolState;
    use serde_json::json;
    use std::time::Duration;

    struct Scripted;

    #[async_trait]
    impl TaskExecutor for Scripted {
        async fn execute(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
            match task.payload["op"].as_str() {
                Some("double") => Ok(json!(task.payload["n"].as_i64().unwrap_or(0) * 2)),
                Some("fail") => anyhow::bail!("requested failure"),
                Some("panic") => panic!("executor blew up"),
                Some("sleep") => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!(null))
                }
                _ => Ok(task.payload.clone()),
            }
        }
    }

    fn pool(metrics: Arc<OrchestratorMetrics>) -> Arc<dyn PoolBackend> {
        spawn_pool(PoolSpec::local("local", 2, Arc::new(Scripted)), metrics).unwrap()
    }

    #[tokio::test]
    async fn test_success_is_collectable() {
        let pool = pool(Arc::new(OrchestratorMetrics::new()));
        let task = Task::new(json!({"op": "double", "n": 21}));
        let task_id = task.id;

        let result = pool.execute(task).await.unwrap();
        assert_eq!(result.output, json!(42));
        assert!(result.worker_id.is_some());

        let batch = pool.collect_results().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.results[0].task_id, task_id);
        assert!(pool.collect_results().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executor_error_is_backend_execution() {
        let pool = pool(Arc::new(OrchestratorMetrics::new()));
        let err = pool
            .execute(Task::new(json!({"op": "fail"})))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::BackendExecution { message, .. } => {
                assert!(message.contains("requested failure"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pool.status().await.unwrap().idle_workers, 2);
    }

    #[tokio::test]
    async fn test_panic_respawns_worker() {
        let metrics = Arc::new(OrchestratorMetrics::new());
        let pool = pool(Arc::clone(&metrics));

        let err = pool
            .execute(Task::new(json!({"op": "panic"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker panicked"));

        let status = pool.status().await.unwrap();
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.idle_workers, 2);
        assert_eq!(metrics.snapshot().workers_respawned, 1);

        // The pool keeps serving
        assert!(pool.execute(Task::new(json!({"op": "echo"}))).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execution_frees_worker() {
        let pool = pool(Arc::new(OrchestratorMetrics::new()));
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            pool.execute(Task::new(json!({"op": "sleep"}))),
        )
        .await;
        assert!(result.is_err());

        let status = pool.status().await.unwrap();
        assert_eq!(status.busy_workers, 0);
        assert_eq!(status.pending_results, 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_task() {
        let pool = pool(Arc::new(OrchestratorMetrics::new()));
        let task = Task::new(json!({"op": "sleep"}));
        let task_id = task.id;

        let execution = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.execute(task).await })
        };
        while pool.runtime().status().busy_workers == 0 {
            tokio::task::yield_now().await;
        }
        pool.cancel(task_id).await;

        let err = execution.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_and_clears_workers() {
        let pool = pool(Arc::new(OrchestratorMetrics::new()));
        pool.close().await.unwrap();

        assert_eq!(pool.state(), PoolState::Closed);
        assert!(matches!(
            pool.execute(Task::new(json!({}))).await,
            Err(OrchestratorError::PoolUnavailable { .. })
        ));
        let status = pool.status().await.unwrap();
        assert_eq!(status.worker_count, 0);
        assert_eq!(status.busy_workers, 0);
    }
}
