//! Cluster pool: tasks become jobs on an externally scheduled cluster
//!
//! Cancellation is best-effort. A cancelled or timed-out job is abandoned:
//! even if the cluster finishes it later, its result is never collected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PoolBackend, PoolRuntime};
use crate::error::{OrchestratorError, Result};
use crate::types::{Task, TaskId, TaskResult};

/// Client for the external job scheduler
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Submit a job for `task`, returning the scheduler's job id
    async fn submit(&self, task: &Task) -> anyhow::Result<String>;

    /// Wait for the job to finish and return its output
    async fn await_result(&self, job_id: &str) -> anyhow::Result<serde_json::Value>;

    /// Ask the scheduler to stop the job
    async fn cancel(&self, job_id: &str) -> anyhow::Result<()>;

    fn name(&self) -> &'static str {
        "ClusterClient"
    }
}

struct Job {
    job_id: String,
    token: CancellationToken,
}

pub struct ClusterPool {
    runtime: PoolRuntime,
    client: Arc<dyn ClusterClient>,
    jobs: Mutex<HashMap<TaskId, Job>>,
}

impl ClusterPool {
    pub fn new(runtime: PoolRuntime, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            runtime,
            client,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn backend_error(&self, task_id: TaskId, message: String) -> OrchestratorError {
        OrchestratorError::BackendExecution {
            pool_id: self.runtime.pool_id().clone(),
            task_id,
            message,
        }
    }

    /// Fire-and-forget remote cancel; usable from `Drop`
    fn cancel_remote(&self, job_id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let pool_id = self.runtime.pool_id().clone();
        handle.spawn(async move {
            if let Err(e) = client.cancel(&job_id).await {
                warn!(pool_id = %pool_id, job_id = %job_id, error = %e, "Cluster job cancel failed");
            }
        });
    }
}

/// Abandons the job if the execution is dropped before it settles
struct Tracked<'a> {
    pool: &'a ClusterPool,
    task_id: TaskId,
    settled: bool,
}

impl Tracked<'_> {
    /// Stop tracking. Returns false if the job was abandoned meanwhile.
    fn settle(mut self) -> bool {
        self.settled = true;
        self.pool.jobs.lock().remove(&self.task_id).is_some()
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let job = self.pool.jobs.lock().remove(&self.task_id);
        if let Some(job) = job {
            debug!(task_id = %self.task_id, job_id = %job.job_id, "Abandoning cluster job");
            self.pool.cancel_remote(job.job_id);
        }
    }
}

#[async_trait]
impl PoolBackend for ClusterPool {
    fn runtime(&self) -> &PoolRuntime {
        &self.runtime
    }

    async fn execute(&self, task: Task) -> Result<TaskResult> {
        let lease = self.runtime.checkout(task.id)?;
        let started = Instant::now();

        let job_id = self
            .client
            .submit(&task)
            .await
            .map_err(|e| self.backend_error(task.id, format!("submit failed: {e:#}")))?;

        let token = CancellationToken::new();
        self.jobs.lock().insert(
            task.id,
            Job {
                job_id: job_id.clone(),
                token: token.clone(),
            },
        );
        let tracked = Tracked {
            pool: self,
            task_id: task.id,
            settled: false,
        };

        let outcome = tokio::select! {
            outcome = self.client.await_result(&job_id) => Some(outcome),
            _ = token.cancelled() => None,
        };
        let still_tracked = tracked.settle();

        let output = match outcome {
            Some(Ok(output)) if still_tracked => output,
            Some(Err(e)) => {
                lease.complete();
                return Err(self.backend_error(task.id, format!("job {job_id} failed: {e:#}")));
            }
            _ => {
                lease.complete();
                return Err(self.backend_error(task.id, format!("job {job_id} abandoned")));
            }
        };

        let result = TaskResult {
            task_id: task.id,
            pool_id: self.runtime.pool_id().clone(),
            worker_id: lease.worker_id(),
            output,
            duration: started.elapsed(),
            completed_at: Utc::now(),
        };
        self.runtime.record_result(result.clone());
        lease.complete();
        Ok(result)
    }

    async fn cancel(&self, task_id: TaskId) {
        let job = self.jobs.lock().remove(&task_id);
        let Some(job) = job else { return };
        job.token.cancel();
        if let Err(e) = self.client.cancel(&job.job_id).await {
            warn!(
                pool_id = %self.runtime.pool_id(),
                job_id = %job.job_id,
                error = %e,
                "Cluster job cancel failed"
            );
        }
    }

    async fn close(&self) -> Result<()> {
        self.runtime.close()?;
        let jobs: Vec<Job> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        for job in jobs {
            job.token.cancel();
            if let Err(e) = self.client.cancel(&job.job_id).await {
                warn!(job_id = %job.job_id, error = %e, "Cluster job cancel failed during close");
            }
        }
        Ok(())
    }
}
