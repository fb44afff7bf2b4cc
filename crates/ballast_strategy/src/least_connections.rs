use std::sync::Mutex;

use ballast_pool::ServerSnapshot;

use crate::Strategy;

/// Minimum-active-connections selection with a rotating tiebreak.
///
/// Candidates tied at the minimum keep the snapshot's arrival order; a
/// separate cursor rotates among them so ties do not pin one server.
pub struct LeastConnectionsStrategy {
    cursor: Mutex<usize>,
}

impl LeastConnectionsStrategy {
    pub fn new() -> Self {
        Self { cursor: Mutex::new(0) }
    }
}

impl Default for LeastConnectionsStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LeastConnectionsStrategy {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }

        let min_active = healthy.iter().map(|s| s.active_connections).min()?;
        let candidates: Vec<&ServerSnapshot> = healthy
            .iter()
            .filter(|s| s.active_connections == min_active)
            .collect();

        let mut cursor = self.cursor.lock().unwrap();
        if *cursor >= candidates.len() {
            *cursor = 0;
        }
        let picked = candidates[*cursor].clone();
        *cursor += 1;
        Some(picked)
    }
}
