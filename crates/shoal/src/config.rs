//! Orchestrator configuration
//!
//! Every component has its own config struct with defaults and `with_*`
//! builders; [`OrchestratorConfig`] bundles them and can be read from
//! `SHOAL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::bus::MessageBusConfig;
use crate::error::{OrchestratorError, Result};
use crate::manager::RoutingStrategy;
use crate::reliability::CircuitBreakerConfig;
use crate::worker::WorkerManagerConfig;

/// Top-level configuration for a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Pool selection strategy for tasks without a usable affinity
    pub routing: RoutingStrategy,

    /// Breaker settings applied to every pool
    pub pool_breaker: CircuitBreakerConfig,

    /// Per-pool execution settings
    pub worker: WorkerManagerConfig,

    /// Optional cap on concurrently executing tasks across all pools.
    ///
    /// When set, one shared semaphore replaces the per-pool semaphores.
    pub global_concurrency_limit: Option<usize>,

    /// Message bus settings
    pub bus: MessageBusConfig,

    /// Result sync settings
    pub aggregator: AggregatorConfig,
}

impl OrchestratorConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `SHOAL_ROUTING_STRATEGY`: `least_loaded`, `round_robin` or `random`
    /// - `SHOAL_BREAKER_THRESHOLD`: consecutive failures before a pool circuit opens
    /// - `SHOAL_BREAKER_COOLDOWN_MS`: time an open circuit waits before a trial call
    /// - `SHOAL_TASK_TIMEOUT_MS`: default deadline for tasks that carry none
    /// - `SHOAL_DRAIN_TIMEOUT_MS`: how long draining waits for in-flight tasks
    /// - `SHOAL_GLOBAL_CONCURRENCY`: shared cap across all pools
    /// - `SHOAL_BUS_MAX_CONCURRENT_SUBSCRIBERS`: bus-wide delivery limit
    /// - `SHOAL_BUS_SUBSCRIBER_TIMEOUT_MS`: per-subscriber delivery timeout
    /// - `SHOAL_SYNC_INTERVAL_MS`: result sync interval
    /// - `SHOAL_SYNC_BATCH_SIZE`: items per store call
    /// - `SHOAL_SYNC_MAX_CONCURRENT_BATCHES`: store calls in flight per cycle
    /// - `SHOAL_SYNC_EVENT_DRIVEN`: sync as soon as a pool turns dirty ("true")
    /// - `SHOAL_STORE_BREAKER_THRESHOLD` / `SHOAL_STORE_BREAKER_COOLDOWN_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let routing = env_parse("SHOAL_ROUTING_STRATEGY").unwrap_or(defaults.routing);

        let pool_breaker = CircuitBreakerConfig {
            threshold: env_parse("SHOAL_BREAKER_THRESHOLD")
                .unwrap_or(defaults.pool_breaker.threshold),
            cooldown_duration: env_millis("SHOAL_BREAKER_COOLDOWN_MS")
                .unwrap_or(defaults.pool_breaker.cooldown_duration),
        };

        let worker = WorkerManagerConfig {
            default_task_timeout: env_millis("SHOAL_TASK_TIMEOUT_MS")
                .or(defaults.worker.default_task_timeout),
            drain_timeout: env_millis("SHOAL_DRAIN_TIMEOUT_MS")
                .unwrap_or(defaults.worker.drain_timeout),
            ..defaults.worker
        };

        let bus = MessageBusConfig {
            max_concurrent_subscribers: env_parse("SHOAL_BUS_MAX_CONCURRENT_SUBSCRIBERS")
                .unwrap_or(defaults.bus.max_concurrent_subscribers),
            subscriber_timeout: env_millis("SHOAL_BUS_SUBSCRIBER_TIMEOUT_MS")
                .unwrap_or(defaults.bus.subscriber_timeout),
        };

        let aggregator = AggregatorConfig {
            interval: env_millis("SHOAL_SYNC_INTERVAL_MS").unwrap_or(defaults.aggregator.interval),
            batch_size: env_parse("SHOAL_SYNC_BATCH_SIZE")
                .unwrap_or(defaults.aggregator.batch_size),
            max_concurrent_batches: env_parse("SHOAL_SYNC_MAX_CONCURRENT_BATCHES")
                .unwrap_or(defaults.aggregator.max_concurrent_batches),
            event_driven: std::env::var("SHOAL_SYNC_EVENT_DRIVEN")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.aggregator.event_driven),
            store_breaker: CircuitBreakerConfig {
                threshold: env_parse("SHOAL_STORE_BREAKER_THRESHOLD")
                    .unwrap_or(defaults.aggregator.store_breaker.threshold),
                cooldown_duration: env_millis("SHOAL_STORE_BREAKER_COOLDOWN_MS")
                    .unwrap_or(defaults.aggregator.store_breaker.cooldown_duration),
            },
        };

        Self {
            routing,
            pool_breaker,
            worker,
            global_concurrency_limit: env_parse("SHOAL_GLOBAL_CONCURRENCY"),
            bus,
            aggregator,
        }
    }

    pub fn with_routing(mut self, routing: RoutingStrategy) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_pool_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.pool_breaker = config;
        self
    }

    pub fn with_worker(mut self, config: WorkerManagerConfig) -> Self {
        self.worker = config;
        self
    }

    pub fn with_global_concurrency_limit(mut self, limit: usize) -> Self {
        self.global_concurrency_limit = Some(limit);
        self
    }

    pub fn with_bus(mut self, config: MessageBusConfig) -> Self {
        self.bus = config;
        self
    }

    pub fn with_aggregator(mut self, config: AggregatorConfig) -> Self {
        self.aggregator = config;
        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.pool_breaker.validate()?;
        self.bus.validate()?;
        self.aggregator.validate()?;
        if self.global_concurrency_limit == Some(0) {
            return Err(OrchestratorError::Config(
                "global_concurrency_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for `Option<Duration>` as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing, RoutingStrategy::LeastLoaded);
        assert_eq!(config.bus.max_concurrent_subscribers, 100);
        assert_eq!(config.aggregator.batch_size, 20);
        assert!(config.global_concurrency_limit.is_none());
    }

    #[test]
    fn test_zero_global_limit_rejected() {
        let config = OrchestratorConfig::default().with_global_concurrency_limit(0);
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("SHOAL_ROUTING_STRATEGY", "round_robin");
        std::env::set_var("SHOAL_BREAKER_THRESHOLD", "7");
        std::env::set_var("SHOAL_SYNC_BATCH_SIZE", "50");
        std::env::set_var("SHOAL_TASK_TIMEOUT_MS", "1500");
        std::env::set_var("SHOAL_SYNC_EVENT_DRIVEN", "TRUE");

        let config = OrchestratorConfig::from_env();

        std::env::remove_var("SHOAL_ROUTING_STRATEGY");
        std::env::remove_var("SHOAL_BREAKER_THRESHOLD");
        std::env::remove_var("SHOAL_SYNC_BATCH_SIZE");
        std::env::remove_var("SHOAL_TASK_TIMEOUT_MS");
        std::env::remove_var("SHOAL_SYNC_EVENT_DRIVEN");

        assert_eq!(config.routing, RoutingStrategy::RoundRobin);
        assert_eq!(config.pool_breaker.threshold, 7);
        assert_eq!(config.aggregator.batch_size, 50);
        assert_eq!(
            config.worker.default_task_timeout,
            Some(Duration::from_millis(1500))
        );
        assert!(config.aggregator.event_driven);
    }

    #[test]
    fn test_serialization_uses_millis() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["bus"]["subscriber_timeout"], 30_000);
        let parsed: OrchestratorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }
}
