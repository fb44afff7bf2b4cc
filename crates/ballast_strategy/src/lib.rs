//! Pluggable upstream selection strategies.
//!
//! A strategy sees an immutable snapshot of the eligible servers and
//! returns exactly one of them. The optional capabilities — key-aware
//! selection, latency feedback, gauges — are default trait methods, so a
//! dispatcher can drive any strategy through the same calls and variants
//! opt in by overriding.

use std::sync::Arc;
use std::time::Duration;

use ballast_config::StrategyKind;
use ballast_pool::ServerSnapshot;
use serde_json::{Value, json};

mod aura;
mod health_score;
mod helios;
mod least_connections;
mod response_time;
mod round_robin;
mod weighted;

pub use aura::AuraStrategy;
pub use health_score::HealthScoreStrategy;
pub use helios::HeliosStrategy;
pub use least_connections::LeastConnectionsStrategy;
pub use response_time::ResponseTimeStrategy;
pub use round_robin::RoundRobinStrategy;
pub use weighted::WeightedRoundRobinStrategy;

pub trait Strategy: Send + Sync {
    /// Wire name, as used in config files and dashboards.
    fn name(&self) -> &'static str;

    /// Pick one server. Returns `None` iff the input is empty.
    ///
    /// Implementations must be safe for concurrent invocation and
    /// linearisable against their own `record_response_time`.
    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot>;

    /// Pick one server for a routing key. Strategies without key
    /// affinity ignore the key.
    fn select_with_key(&self, healthy: &[ServerSnapshot], _key: &str) -> Option<ServerSnapshot> {
        self.select(healthy)
    }

    /// Latency feedback after a completed request. Default: dropped.
    fn record_response_time(&self, _host: &str, _port: u16, _elapsed: Duration) {}

    /// Strategy-specific gauges for dashboards.
    fn metrics(&self) -> Value {
        json!({})
    }

    /// Per-server gauges for dashboards.
    fn server_metrics(&self, _host: &str, _port: u16) -> Value {
        json!({})
    }
}

/// Build a fresh strategy instance. Swapping strategies at runtime means
/// building a new instance; prior per-strategy state is discarded.
pub fn build(kind: StrategyKind) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new()),
        StrategyKind::LeastConnections => Arc::new(LeastConnectionsStrategy::new()),
        StrategyKind::HealthScore => Arc::new(HealthScoreStrategy::new()),
        StrategyKind::WeightedRoundRobin => Arc::new(WeightedRoundRobinStrategy::new()),
        StrategyKind::ResponseTime => Arc::new(ResponseTimeStrategy::new()),
        StrategyKind::Aura => Arc::new(AuraStrategy::new()),
        StrategyKind::Helios => Arc::new(HeliosStrategy::new()),
    }
}
