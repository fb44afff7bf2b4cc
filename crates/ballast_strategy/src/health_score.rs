use std::sync::Mutex;

use ballast_pool::ServerSnapshot;

use crate::Strategy;

/// Scores treated as equal when within this distance of the best.
const SCORE_EPSILON: f64 = 1e-3;

/// Health-score-based selection.
///
/// `score = 1/(1 + active) · 1/(1 + failures)` — the multiplicative form
/// penalises both saturation and instability without additive weight
/// tuning. Servers tied at the best score rotate round-robin.
pub struct HealthScoreStrategy {
    last_index: Mutex<usize>,
}

impl HealthScoreStrategy {
    pub fn new() -> Self {
        Self { last_index: Mutex::new(0) }
    }

    fn score(server: &ServerSnapshot) -> f64 {
        let connection_factor = 1.0 / (1.0 + server.active_connections as f64);
        let failure_factor = 1.0 / (1.0 + server.failures as f64);
        connection_factor * failure_factor
    }
}

impl Default for HealthScoreStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for HealthScoreStrategy {
    fn name(&self) -> &'static str {
        "health_score"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }

        let mut best_score = f64::MIN;
        let scores: Vec<f64> = healthy
            .iter()
            .map(|server| {
                let score = Self::score(server);
                if score > best_score {
                    best_score = score;
                }
                score
            })
            .collect();

        let best: Vec<&ServerSnapshot> = healthy
            .iter()
            .zip(&scores)
            .filter(|&(_, &score)| (score - best_score).abs() < SCORE_EPSILON)
            .map(|(server, _)| server)
            .collect();

        if best.len() > 1 {
            let mut last_index = self.last_index.lock().unwrap();
            *last_index = (*last_index + 1) % best.len();
            Some(best[*last_index].clone())
        } else {
            best.first().map(|server| (*server).clone())
        }
    }
}
