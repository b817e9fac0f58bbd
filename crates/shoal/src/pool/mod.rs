//! Pool backends
//!
//! A pool is a group of workers on one execution substrate. Every backend
//! implements [`PoolBackend`] on top of a shared [`PoolRuntime`], so the
//! lifecycle rules are identical across substrates:
//!
//! - `execute` runs a task once; the pool itself never retries
//! - `collect_results` returns and clears only results not yet returned
//! - `scale` fails with `InvalidTransition` unless the pool is `Running`
//! - `close` is terminal
//!
//! Backend kinds are a closed set built by [`spawn_pool`].

mod cluster;
mod delegated;
mod local;
mod runtime;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;
use crate::types::{BackendKind, PoolId, PoolState, PoolStatus, ResultBatch, Task, TaskId, TaskResult};

pub use cluster::{ClusterClient, ClusterPool};
pub use delegated::{DelegatedConfig, DelegatedPool};
pub use local::{LocalPool, TaskExecutor};
pub use runtime::{
    DurationWindow, PoolRuntime, Transition, WorkerInfo, WorkerLease, DEFAULT_DURATION_WINDOW,
};

// ============================================================================
// PoolBackend Trait
// ============================================================================

/// Capability interface every pool substrate implements.
///
/// Deadlines are enforced by the caller: dropping an `execute` future
/// cancels the execution, and [`PoolBackend::cancel`] asks the substrate to
/// stop a task it may still be running remotely.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Lifecycle, workers and results shared by all backends
    fn runtime(&self) -> &PoolRuntime;

    fn pool_id(&self) -> &PoolId {
        self.runtime().pool_id()
    }

    fn kind(&self) -> BackendKind {
        self.runtime().kind()
    }

    fn state(&self) -> PoolState {
        self.runtime().state()
    }

    /// Run one task to completion.
    ///
    /// On success the result is already held for `collect_results` when
    /// this returns.
    async fn execute(&self, task: Task) -> Result<TaskResult>;

    /// Best-effort cancellation of a running task. Unknown ids are ignored.
    async fn cancel(&self, task_id: TaskId);

    async fn collect_results(&self) -> Result<ResultBatch> {
        Ok(ResultBatch {
            pool_id: self.pool_id().clone(),
            results: self.runtime().take_results(),
        })
    }

    async fn status(&self) -> Result<PoolStatus> {
        Ok(self.runtime().status())
    }

    /// Resize to `target_size` workers
    async fn scale(&self, target_size: usize) -> Result<()> {
        self.runtime().begin_scale(target_size)?;
        self.runtime().resize(target_size)
    }

    /// Stop accepting tasks; running tasks continue
    async fn drain(&self) -> Result<()> {
        self.runtime().drain()
    }

    /// Stop everything and release the workers
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Substrate-specific settings
#[derive(Clone)]
pub enum BackendConfig {
    /// In-process tasks running `executor`
    Local { executor: Arc<dyn TaskExecutor> },

    /// One external process per task
    Delegated(DelegatedConfig),

    /// Jobs on an externally scheduled cluster
    Cluster { client: Arc<dyn ClusterClient> },
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local { .. } => BackendKind::Local,
            Self::Delegated(_) => BackendKind::Delegated,
            Self::Cluster { .. } => BackendKind::Cluster,
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { .. } => f.debug_struct("Local").finish_non_exhaustive(),
            Self::Delegated(config) => f.debug_tuple("Delegated").field(config).finish(),
            Self::Cluster { client } => f
                .debug_struct("Cluster")
                .field("client", &client.name())
                .finish(),
        }
    }
}

/// Everything needed to bring up a pool
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub pool_id: PoolId,
    pub target_size: usize,
    pub backend: BackendConfig,
    /// Capacity of the recent-duration window
    pub duration_window: usize,
}

impl PoolSpec {
    pub fn new(pool_id: impl Into<PoolId>, target_size: usize, backend: BackendConfig) -> Self {
        Self {
            pool_id: pool_id.into(),
            target_size,
            backend,
            duration_window: DEFAULT_DURATION_WINDOW,
        }
    }

    pub fn local(
        pool_id: impl Into<PoolId>,
        target_size: usize,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self::new(pool_id, target_size, BackendConfig::Local { executor })
    }

    pub fn delegated(pool_id: impl Into<PoolId>, target_size: usize, config: DelegatedConfig) -> Self {
        Self::new(pool_id, target_size, BackendConfig::Delegated(config))
    }

    pub fn cluster(
        pool_id: impl Into<PoolId>,
        target_size: usize,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        Self::new(pool_id, target_size, BackendConfig::Cluster { client })
    }

    pub fn with_duration_window(mut self, capacity: usize) -> Self {
        self.duration_window = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_id.as_str().is_empty() {
            return Err(OrchestratorError::Config("pool_id must not be empty".into()));
        }
        if self.target_size == 0 {
            return Err(OrchestratorError::Config(format!(
                "pool {} target_size must be at least 1",
                self.pool_id
            )));
        }
        if let BackendConfig::Delegated(config) = &self.backend {
            config.validate()?;
        }
        Ok(())
    }
}

/// Build the backend for `spec` and bring it to `Running`
pub fn spawn_pool(spec: PoolSpec, metrics: Arc<OrchestratorMetrics>) -> Result<Arc<dyn PoolBackend>> {
    spec.validate()?;
    let runtime = PoolRuntime::new(
        spec.pool_id,
        spec.backend.kind(),
        spec.target_size,
        spec.duration_window,
        metrics,
    );

    let backend: Arc<dyn PoolBackend> = match spec.backend {
        BackendConfig::Local { executor } => Arc::new(LocalPool::new(runtime, executor)),
        BackendConfig::Delegated(config) => Arc::new(DelegatedPool::new(runtime, config)),
        BackendConfig::Cluster { client } => Arc::new(ClusterPool::new(runtime, client)),
    };
    backend.runtime().start()?;
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
            Ok(task.payload.clone())
        }
    }

    #[test]
    fn test_spec_validation() {
        let spec = PoolSpec::local("a", 0, Arc::new(Echo));
        assert!(matches!(spec.validate(), Err(OrchestratorError::Config(_))));

        let spec = PoolSpec::local("", 1, Arc::new(Echo));
        assert!(spec.validate().is_err());
    }

    #[tokio::test]
    async fn test_spawn_pool_starts_running() {
        let pool = spawn_pool(
            PoolSpec::local("cpu", 2, Arc::new(Echo)),
            Arc::new(OrchestratorMetrics::new()),
        )
        .unwrap();

        assert_eq!(pool.kind(), BackendKind::Local);
        assert_eq!(pool.state(), PoolState::Running);
        let status = pool.status().await.unwrap();
        assert_eq!(status.worker_count, 2);
        assert_eq!(pool.runtime().take_transitions().len(), 1);
    }

    #[tokio::test]
    async fn test_default_scale_respects_lifecycle() {
        let pool = spawn_pool(
            PoolSpec::local("cpu", 2, Arc::new(Echo)),
            Arc::new(OrchestratorMetrics::new()),
        )
        .unwrap();

        pool.scale(5).await.unwrap();
        assert_eq!(pool.status().await.unwrap().worker_count, 5);

        pool.drain().await.unwrap();
        assert!(matches!(
            pool.scale(1).await,
            Err(OrchestratorError::InvalidTransition {
                state: PoolState::Draining,
                ..
            })
        ));
        pool.close().await.unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
    }
}
