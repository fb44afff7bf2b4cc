// =======================================================
// STRATEGY NAMES
// =======================================================
//
// Wire names match what dashboards and config files already use;
// `alpha1` is the tail-latency strategy, `beta1` the cache-affinity one.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    HealthScore,
    WeightedRoundRobin,
    ResponseTime,
    Aura,
    Helios,
}

impl StrategyKind {
    /// Parse a config-file strategy name. Unknown names return `None`;
    /// callers fall back to round robin.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(StrategyKind::RoundRobin),
            "least_connections" => Some(StrategyKind::LeastConnections),
            "health_score" => Some(StrategyKind::HealthScore),
            "weighted_round_robin" => Some(StrategyKind::WeightedRoundRobin),
            "response_time" => Some(StrategyKind::ResponseTime),
            "alpha1" => Some(StrategyKind::Aura),
            "beta1" => Some(StrategyKind::Helios),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::LeastConnections => "least_connections",
            StrategyKind::HealthScore => "health_score",
            StrategyKind::WeightedRoundRobin => "weighted_round_robin",
            StrategyKind::ResponseTime => "response_time",
            StrategyKind::Aura => "alpha1",
            StrategyKind::Helios => "beta1",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
