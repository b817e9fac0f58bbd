//! Pool registry and router
//!
//! [`PoolManager`] owns every pool's [`WorkerManager`] and the
//! [`RoutingIndex`] in a single registry behind one structural mutex. The
//! mutex guards in-memory bookkeeping only; it is never held while a task
//! executes or a network call is made.
//!
//! # Routing
//!
//! 1. A task with an affinity goes to that pool if it accepts tasks.
//!    Unknown pools fail with `PoolNotFound`, non-running ones with
//!    `PoolUnavailable`. Neither is retryable.
//! 2. Otherwise the configured [`RoutingStrategy`] picks among pools that
//!    accept tasks. Draining and closed pools are never in the index.
//!
//! Out-of-band load changes (timeouts, worker failures, lifecycle changes)
//! raise a shared flag; the next routing call rebuilds the index first.

mod routing;

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::{ResultSink, ResultSource};
use crate::bus::MessageBus;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;
use crate::pool::{spawn_pool, PoolBackend, PoolSpec};
use crate::reliability::{BreakerSnapshot, CircuitBreakerRegistry, RetryPolicy};
use crate::types::{PoolId, PoolStatus, ResultBatch, Task, TaskId, TaskResult};
use crate::worker::WorkerManager;

pub use routing::{RoutingIndex, RoutingStrategy};

/// Status and freshly collected results of one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolReport {
    pub status: PoolStatus,
    pub results: ResultBatch,
}

struct Registry {
    pools: HashMap<PoolId, Arc<WorkerManager>>,
    /// Registration order, for round robin and default reporting order
    order: Vec<PoolId>,
    index: RoutingIndex,
}

impl Registry {
    fn rebuild_index(&mut self) {
        let entries: Vec<(PoolId, usize)> = self
            .order
            .iter()
            .filter_map(|id| self.pools.get(id))
            .filter(|m| m.state().accepts_tasks())
            .map(|m| (m.pool_id().clone(), m.load()))
            .collect();
        self.index.rebuild(entries);
    }
}

/// One routed task's share of a pool's index load.
///
/// Dropping it settles the index from the pool's actual load, so a routing
/// future that is cancelled mid-execution does not leave its reservation
/// behind.
struct LoadReservation<R: Deref<Target = PoolManager>> {
    router: R,
    pool: Arc<WorkerManager>,
}

impl<R: Deref<Target = PoolManager>> Drop for LoadReservation<R> {
    fn drop(&mut self) {
        self.router.settle_load(&self.pool);
    }
}

/// Pool registry, router and lifecycle entry point
pub struct PoolManager {
    config: OrchestratorConfig,
    registry: Mutex<Registry>,
    breakers: CircuitBreakerRegistry,
    bus: Arc<MessageBus>,
    metrics: Arc<OrchestratorMetrics>,
    global_limiter: Option<Arc<Semaphore>>,
    load_changed: Arc<AtomicBool>,
    cursor: AtomicUsize,
    tracker: TaskTracker,
    result_sink: RwLock<Option<Weak<dyn ResultSink>>>,
}

impl PoolManager {
    pub fn new(
        config: OrchestratorConfig,
        bus: Arc<MessageBus>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.pool_breaker.clone())
            .with_metrics(Arc::clone(&metrics));
        let global_limiter = config
            .global_concurrency_limit
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            config,
            registry: Mutex::new(Registry {
                pools: HashMap::new(),
                order: Vec::new(),
                index: RoutingIndex::new(),
            }),
            breakers,
            bus,
            metrics,
            global_limiter,
            load_changed: Arc::new(AtomicBool::new(false)),
            cursor: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
            result_sink: RwLock::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    pub fn routing_strategy(&self) -> RoutingStrategy {
        self.config.routing
    }

    /// Forward results drained by [`PoolManager::aggregate_status`] to `sink`
    /// so they still reach the sync pipeline. Held weakly.
    pub fn set_result_sink(&self, sink: &Arc<dyn ResultSink>) {
        *self.result_sink.write() = Some(Arc::downgrade(sink));
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register a running backend under its pool id
    pub async fn register_pool(&self, backend: Arc<dyn PoolBackend>) -> Result<()> {
        let pool_id = backend.pool_id().clone();
        let breaker = self.breakers.get(&format!("pool:{pool_id}"));
        let mut manager = WorkerManager::new(
            backend,
            breaker,
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
        )
        .with_config(self.config.worker.clone())
        .with_load_signal(Arc::clone(&self.load_changed));
        if let Some(limiter) = &self.global_limiter {
            manager = manager.with_shared_limiter(Arc::clone(limiter));
        }
        let manager = Arc::new(manager);

        {
            let mut registry = self.registry.lock();
            if registry.pools.contains_key(&pool_id) {
                return Err(OrchestratorError::PoolAlreadyExists(pool_id));
            }
            registry.pools.insert(pool_id.clone(), Arc::clone(&manager));
            registry.order.push(pool_id.clone());
            if manager.state().accepts_tasks() {
                registry.index.upsert(pool_id.clone(), manager.load());
            }
        }

        info!(pool_id = %pool_id, kind = %manager.kind(), "Pool registered");
        manager.publish_transitions().await;
        Ok(())
    }

    /// Build a pool from `spec`, bring it up and register it
    #[instrument(skip(self, spec), fields(pool_id = %spec.pool_id))]
    pub async fn spawn_pool(&self, spec: PoolSpec) -> Result<()> {
        if self.registry.lock().pools.contains_key(&spec.pool_id) {
            return Err(OrchestratorError::PoolAlreadyExists(spec.pool_id));
        }
        let backend = spawn_pool(spec, Arc::clone(&self.metrics))?;
        self.register_pool(backend).await
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.registry.lock().order.clone()
    }

    fn manager(&self, pool_id: &PoolId) -> Result<Arc<WorkerManager>> {
        self.registry
            .lock()
            .pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::PoolNotFound(pool_id.clone()))
    }

    pub async fn pool_status(&self, pool_id: &PoolId) -> Result<PoolStatus> {
        self.manager(pool_id)?.status().await
    }

    pub async fn scale_pool(&self, pool_id: &PoolId, target_size: usize) -> Result<()> {
        self.manager(pool_id)?.scale(target_size).await
    }

    /// Stop routing to the pool, then drain it
    pub async fn drain_pool(&self, pool_id: &PoolId) -> Result<()> {
        let manager = self.manager(pool_id)?;
        manager.drain().await?;
        self.registry.lock().index.remove(pool_id);
        Ok(())
    }

    /// Close the pool. It stays registered so affinity to it fails with
    /// `PoolUnavailable`.
    pub async fn close_pool(&self, pool_id: &PoolId) -> Result<()> {
        let manager = self.manager(pool_id)?;
        self.registry.lock().index.remove(pool_id);
        manager.close().await
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Rebuild the routing index if it is dirty. Returns whether it rebuilt.
    pub fn rebuild_index(&self) -> bool {
        let mut registry = self.registry.lock();
        if self.load_changed.swap(false, Ordering::AcqRel) {
            registry.index.mark_dirty();
        }
        if !registry.index.is_dirty() {
            return false;
        }
        registry.rebuild_index();
        self.metrics.index_rebuilt();
        debug!(pools = registry.index.len(), "Routing index rebuilt");
        true
    }

    /// Current index contents, sorted by pool id
    pub fn index_snapshot(&self) -> Vec<(PoolId, usize)> {
        self.registry.lock().index.snapshot()
    }

    /// Choose a pool for `task` and count it against that pool's load
    fn select(&self, task: &Task) -> Result<Arc<WorkerManager>> {
        if self.tracker.is_closed() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if let Some(pool_id) = &task.affinity {
            let manager = self.manager(pool_id)?;
            let state = manager.state();
            if !state.accepts_tasks() {
                return Err(OrchestratorError::PoolUnavailable {
                    pool_id: pool_id.clone(),
                    state,
                });
            }
            self.registry.lock().index.reserve(pool_id);
            return Ok(manager);
        }

        self.rebuild_index();
        let mut registry = self.registry.lock();
        match self.config.routing {
            RoutingStrategy::LeastLoaded => loop {
                let pool_id = registry
                    .index
                    .acquire_least_loaded()
                    .ok_or(OrchestratorError::NoRoutablePool)?;
                let routable = registry
                    .pools
                    .get(&pool_id)
                    .filter(|m| m.state().accepts_tasks())
                    .cloned();
                match routable {
                    Some(manager) => return Ok(manager),
                    // Changed state without a signal yet
                    None => {
                        registry.index.remove(&pool_id);
                    }
                }
            },
            RoutingStrategy::RoundRobin | RoutingStrategy::Random => {
                let count = registry.order.len();
                if count == 0 {
                    return Err(OrchestratorError::NoRoutablePool);
                }
                let start = match self.config.routing {
                    RoutingStrategy::Random => rand::thread_rng().gen_range(0..count),
                    _ => self.cursor.fetch_add(1, Ordering::Relaxed),
                };
                for offset in 0..count {
                    let pool_id = &registry.order[(start + offset) % count];
                    let Some(manager) = registry.pools.get(pool_id) else {
                        continue;
                    };
                    if manager.state().accepts_tasks() {
                        let manager = Arc::clone(manager);
                        registry.index.reserve(manager.pool_id());
                        return Ok(manager);
                    }
                }
                Err(OrchestratorError::NoRoutablePool)
            }
        }
    }

    /// Refresh the pool's index entry from its actual load
    fn settle_load(&self, manager: &WorkerManager) {
        let mut registry = self.registry.lock();
        if registry.index.contains(manager.pool_id()) {
            registry
                .index
                .upsert(manager.pool_id().clone(), manager.load());
        }
    }

    /// Route `task` and run it to completion
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn route_task(&self, task: Task) -> Result<TaskResult> {
        let reservation = LoadReservation {
            router: self,
            pool: self.select(&task)?,
        };
        self.metrics.task_routed();
        debug!(pool_id = %reservation.pool.pool_id(), "Task routed");
        let outcome = reservation.pool.execute(task).await;
        drop(reservation);
        outcome
    }

    /// Route with retries on transient failures.
    ///
    /// Open circuits, timeouts and an empty routing table are retried with
    /// backoff; the wait after an open circuit is at least its remaining
    /// cooldown. Backend failures and structural errors are returned at once.
    pub async fn route_with_retry(&self, task: Task, policy: &RetryPolicy) -> Result<TaskResult> {
        let mut attempt = 1;
        loop {
            match self.route_task(task.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if policy.should_retry(&e) && policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = policy.delay_after(attempt, &e);
                    debug!(
                        task_id = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying task"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Accept `task` for background execution.
    ///
    /// Routing is decided before this returns, so an unknown or closed
    /// affinity pool fails immediately. The outcome is reported on the bus
    /// and the result is held by the pool until collected.
    pub fn submit(self: &Arc<Self>, task: Task) -> Result<TaskId> {
        let task_id = task.id;
        let reservation = LoadReservation {
            router: Arc::clone(self),
            pool: self.select(&task)?,
        };
        self.metrics.task_routed();
        debug!(task_id = %task_id, pool_id = %reservation.pool.pool_id(), "Task submitted");

        self.tracker.spawn(async move {
            // Failures are logged and published as task.failed by the WorkerManager
            let _ = reservation.pool.execute(task).await;
        });
        Ok(task_id)
    }

    /// Tasks accepted by `submit` and still running
    pub fn submitted_in_flight(&self) -> usize {
        self.tracker.len()
    }

    // ========================================================================
    // Status and results
    // ========================================================================

    pub async fn collect_results(&self, pool_id: &PoolId) -> Result<ResultBatch> {
        self.manager(pool_id)?.collect_results().await
    }

    /// Status and results for `pool_ids` (all pools when `None`), gathered
    /// concurrently. A failing pool yields an error entry; the others are
    /// unaffected.
    pub async fn aggregate_status(
        &self,
        pool_ids: Option<&[PoolId]>,
    ) -> Vec<(PoolId, Result<PoolReport>)> {
        let targets: Vec<(PoolId, Option<Arc<WorkerManager>>)> = {
            let registry = self.registry.lock();
            let ids = pool_ids.map_or_else(|| registry.order.clone(), <[PoolId]>::to_vec);
            ids.into_iter()
                .map(|id| {
                    let manager = registry.pools.get(&id).cloned();
                    (id, manager)
                })
                .collect()
        };
        let sink = self.result_sink.read().as_ref().and_then(Weak::upgrade);

        let reports = targets.into_iter().map(|(pool_id, manager)| {
            let sink = sink.clone();
            async move {
                let Some(manager) = manager else {
                    let err = OrchestratorError::PoolNotFound(pool_id.clone());
                    return (pool_id, Err(err));
                };
                let (status, results) = tokio::join!(manager.status(), manager.collect_results());

                // Drained results must not be lost, even if status failed
                if let (Some(sink), Ok(batch)) = (&sink, &results) {
                    if !batch.is_empty() {
                        sink.accept(batch.clone()).await;
                    }
                }

                let report = match (status, results) {
                    (Ok(status), Ok(results)) => Ok(PoolReport { status, results }),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(pool_id = %pool_id, error = %e, "Pool status collection failed");
                        Err(e)
                    }
                };
                (pool_id, report)
            }
        });
        join_all(reports).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting submissions and let the accepted ones finish, then
    /// drain and close every pool
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down pool manager");
        self.tracker.close();
        if tokio::time::timeout(self.config.worker.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tracker.len(), "Submitted tasks still running at shutdown");
        }

        let managers: Vec<Arc<WorkerManager>> = {
            let mut registry = self.registry.lock();
            registry.index.rebuild(std::iter::empty());
            registry.order.iter().filter_map(|id| registry.pools.get(id).cloned()).collect()
        };

        join_all(managers.iter().map(|manager| async move {
            if manager.state().accepts_tasks() {
                if let Err(e) = manager.drain().await {
                    warn!(pool_id = %manager.pool_id(), error = %e, "Drain failed during shutdown");
                }
            }
        }))
        .await;

        join_all(managers.iter().map(|manager| async move {
            if let Err(e) = manager.close().await {
                warn!(pool_id = %manager.pool_id(), error = %e, "Close failed during shutdown");
            }
        }))
        .await;
        info!("Pool manager stopped");
    }
}

#[async_trait]
impl ResultSource for PoolManager {
    async fn collect_results(&self, pool_id: &PoolId) -> Result<ResultBatch> {
        PoolManager::collect_results(self, pool_id).await
    }
}
