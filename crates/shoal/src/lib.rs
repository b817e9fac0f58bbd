// Pool Orchestration Core
//
// Dispatches tasks across heterogeneous worker pools and syncs their results
// to an external memory store.
//
// Key design decisions:
// - Pool backends (local, delegated, cluster) are a closed set behind one trait
// - One WorkerManager per pool owns its semaphore and circuit breaker
// - PoolManager owns the only registry; its lock never spans execution
// - Routing uses a lazily rebuilt min-heap of pool loads
// - The bus bounds concurrent subscriber calls and times each one out
// - MemoryAggregator syncs in bounded, breaker-guarded chunks

// Domain types and errors
pub mod error;
pub mod types;

// Configuration and observability
pub mod config;
pub mod metrics;
pub mod telemetry;

// Resilience primitives
pub mod reliability;

pub mod aggregator;
pub mod bus;
pub mod manager;
pub mod pool;
pub mod worker;

// Re-exports for convenience
pub use aggregator::{
    AggregatorConfig, AggregatorHandle, HttpMemoryStore, InMemoryMemoryStore, MemoryAggregator,
    MemoryItem, MemoryStore, ResultSink, ResultSource, StoreReceipt, SyncReport,
};
pub use bus::{
    BusMessage, MessageBus, MessageBusConfig, PublishReport, Subscriber, SubscriptionId,
    POOL_LIFECYCLE_CHANGED, TASK_COMPLETED, TASK_FAILED,
};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use manager::{PoolManager, PoolReport, RoutingIndex, RoutingStrategy};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics};
pub use pool::{
    spawn_pool, BackendConfig, ClusterClient, DelegatedConfig, PoolBackend, PoolSpec,
    TaskExecutor,
};
pub use reliability::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    RetryPolicy,
};
pub use types::{
    BackendKind, PoolId, PoolState, PoolStatus, ResultBatch, Task, TaskId, TaskResult, WorkerId,
    WorkerStatus,
};
pub use worker::{WorkerManager, WorkerManagerConfig};
