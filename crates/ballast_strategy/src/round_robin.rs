use std::sync::Mutex;

use ballast_pool::ServerSnapshot;

use crate::Strategy;

/// Rotating-index selection.
///
/// The cursor lives outside the list, which may grow or shrink between
/// calls; on overflow it clamps back to zero rather than rescaling, so a
/// resize can skew the next pick by one position.
pub struct RoundRobinStrategy {
    cursor: Mutex<usize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self { cursor: Mutex::new(0) }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap();
        if *cursor >= healthy.len() {
            *cursor = 0;
        }
        let picked = healthy[*cursor].clone();
        *cursor += 1;
        Some(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::RoundRobinStrategy;
    use crate::{Strategy, testutil::servers};

    #[test]
    fn alternates_over_two_servers() {
        let strategy = RoundRobinStrategy::new();
        let list = servers(&[(1111, 0, 0), (2222, 0, 0)]);
        let picks: Vec<u16> = (0..4)
            .map(|_| strategy.select(&list).expect("non-empty").port)
            .collect();
        assert_eq!(picks, vec![1111, 2222, 1111, 2222]);
    }

    #[test]
    fn spreads_evenly_over_many_rounds() {
        let strategy = RoundRobinStrategy::new();
        let list = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        let mut counts = [0u32; 3];
        for _ in 0..10 {
            let picked = strategy.select(&list).expect("non-empty");
            counts[(picked.port - 1) as usize] += 1;
        }
        // 10 selections over 3 servers: each gets floor(10/3) or ceil(10/3).
        for count in counts {
            assert!((3..=4).contains(&count), "counts: {counts:?}");
        }
    }

    #[test]
    fn cursor_clamps_when_the_list_shrinks() {
        let strategy = RoundRobinStrategy::new();
        let three = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        strategy.select(&three);
        strategy.select(&three);
        let one = servers(&[(1, 0, 0)]);
        assert_eq!(strategy.select(&one).expect("non-empty").port, 1);
    }
}
