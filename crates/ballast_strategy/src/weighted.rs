use std::collections::HashMap;
use std::sync::Mutex;

use ballast_pool::ServerSnapshot;

use crate::Strategy;

/// Failure-aware weighted round robin.
///
/// Weights come from the consecutive-failure streak: a stable server gets
/// 10 requests per turn, a wobbly one 5, anything worse 1. Weights are
/// recomputed from the snapshot on every call, so recovery is picked up
/// as soon as the monitor clears the streak.
pub struct WeightedRoundRobinStrategy {
    state: Mutex<WrrState>,
}

#[derive(Default)]
struct WrrState {
    weights: HashMap<String, i32>,
    current: Option<String>,
    remaining: i32,
    index: usize,
}

fn weight_for(failures: u32) -> i32 {
    match failures {
        0 => 10,
        1 => 5,
        _ => 1,
    }
}

impl WeightedRoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WrrState::default()),
        }
    }
}

impl Default for WeightedRoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for WeightedRoundRobinStrategy {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap();

        for server in healthy {
            state.weights.insert(server.key(), weight_for(server.failures));
        }

        // Start over when there is no current server, the current one left
        // the snapshot, or its weight allotment is used up.
        let current_in_list = state
            .current
            .as_ref()
            .is_some_and(|key| healthy.iter().any(|s| &s.key() == key));
        if state.current.is_none() || !current_in_list || state.remaining <= 0 {
            state.index = 0;
            let key = healthy[0].key();
            state.remaining = state.weights.get(&key).copied().unwrap_or(1);
            state.current = Some(key);
        }

        let picked = state
            .current
            .as_ref()
            .and_then(|key| healthy.iter().find(|s| &s.key() == key))
            .cloned()
            .unwrap_or_else(|| healthy[0].clone());

        state.remaining -= 1;

        // Allotment spent: advance to the next server for the following call.
        if state.remaining <= 0 {
            state.index = (state.index + 1) % healthy.len();
            let key = healthy[state.index].key();
            state.remaining = state.weights.get(&key).copied().unwrap_or(1);
            state.current = Some(key);
        }

        Some(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::WeightedRoundRobinStrategy;
    use crate::{Strategy, testutil::servers};

    #[test]
    fn serves_weight_allotment_before_advancing() {
        let strategy = WeightedRoundRobinStrategy::new();
        let list = servers(&[(1, 0, 0), (2, 0, 1)]);
        let picks: Vec<u16> = (0..15)
            .map(|_| strategy.select(&list).expect("non-empty").port)
            .collect();
        // 10 turns for the clean server, then 5 for the one with a failure.
        assert_eq!(&picks[..10], &[1; 10]);
        assert_eq!(&picks[10..], &[2; 5]);
    }

    #[test]
    fn degraded_servers_get_minimum_weight() {
        let strategy = WeightedRoundRobinStrategy::new();
        let list = servers(&[(1, 0, 4), (2, 0, 4)]);
        let picks: Vec<u16> = (0..4)
            .map(|_| strategy.select(&list).expect("non-empty").port)
            .collect();
        assert_eq!(picks, vec![1, 2, 1, 2]);
    }

    #[test]
    fn resets_when_current_server_disappears() {
        let strategy = WeightedRoundRobinStrategy::new();
        let both = servers(&[(1, 0, 0), (2, 0, 0)]);
        strategy.select(&both);
        // Server 1 drops out mid-allotment; selection restarts from the
        // head of the new snapshot.
        let only_two = servers(&[(2, 0, 0)]);
        assert_eq!(strategy.select(&only_two).expect("non-empty").port, 2);
    }

    #[test]
    fn weight_recovers_with_the_failure_streak() {
        let strategy = WeightedRoundRobinStrategy::new();
        let degraded = servers(&[(1, 0, 2)]);
        strategy.select(&degraded);
        // Streak cleared between calls: full weight applies on the next turn.
        let recovered = servers(&[(1, 0, 0)]);
        for _ in 0..10 {
            assert_eq!(strategy.select(&recovered).expect("non-empty").port, 1);
        }
    }
}
