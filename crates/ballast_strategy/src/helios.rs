use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ballast_pool::{ServerSnapshot, server_key};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::Strategy;

/// Recent keys remembered per server; the oldest half is evicted on
/// overflow.
const RECENT_KEY_LIMIT: usize = 1000;

const DEFAULT_CAPACITY_FACTOR: f64 = 1.25;
const DEFAULT_WARMUP_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_WARMUP_QUOTA_FACTOR: f64 = 0.3;

/// HELIOS — bounded-load cache-aware rendezvous hashing.
///
/// Keys map stably onto servers via HRW ranking, overload is prevented by
/// capping per-server load at `capacity_factor × mean load`, and servers
/// that join later take traffic gradually through a warm-up quota.
pub struct HeliosStrategy {
    capacity_factor: f64,
    warmup_duration: Duration,
    warmup_quota_factor: f64,
    state: Mutex<HeliosState>,
}

#[derive(Default)]
struct HeliosState {
    servers: HashMap<String, HeliosServerState>,
    known_servers: HashSet<String>,
    total_requests: u64,
    cache_hits: u64,
    bounded_load_redirects: u64,
    warmup_redirects: u64,
}

#[derive(Default)]
struct HeliosServerState {
    total_requests: u64,
    recent_keys: HashSet<String>,
    key_order: VecDeque<String>,
    is_new: bool,
    warmup_start: Option<Instant>,
    warmup_requests: u64,
}

impl HeliosServerState {
    fn remember_key(&mut self, key: &str) {
        if self.recent_keys.insert(key.to_string()) {
            self.key_order.push_back(key.to_string());
        }
        if self.key_order.len() > RECENT_KEY_LIMIT {
            // Drop the oldest half in one sweep.
            while self.key_order.len() > RECENT_KEY_LIMIT / 2 {
                if let Some(evicted) = self.key_order.pop_front() {
                    self.recent_keys.remove(&evicted);
                }
            }
        }
    }

    fn warmup_progress(&self, warmup_duration: Duration) -> f64 {
        match (self.is_new, self.warmup_start) {
            (true, Some(start)) => {
                let elapsed = start.elapsed().as_secs_f64();
                ((elapsed / warmup_duration.as_secs_f64()) * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

impl HeliosStrategy {
    pub fn new() -> Self {
        Self::with_tunables(
            DEFAULT_CAPACITY_FACTOR,
            DEFAULT_WARMUP_DURATION,
            DEFAULT_WARMUP_QUOTA_FACTOR,
        )
    }

    pub fn with_tunables(
        capacity_factor: f64,
        warmup_duration: Duration,
        warmup_quota_factor: f64,
    ) -> Self {
        Self {
            capacity_factor,
            warmup_duration,
            warmup_quota_factor,
            state: Mutex::new(HeliosState::default()),
        }
    }

    /// Rank servers by rendezvous weight for a key: the SHA-256 digest of
    /// `key:host:port`, compared as a big-endian unsigned value, highest
    /// first.
    fn hrw_rank<'a>(key: &str, servers: &'a [ServerSnapshot]) -> Vec<&'a ServerSnapshot> {
        let mut ranked: Vec<(&ServerSnapshot, [u8; 32])> = servers
            .iter()
            .map(|server| {
                let mut hasher = Sha256::new();
                hasher.update(key.as_bytes());
                hasher.update(b":");
                hasher.update(server.key().as_bytes());
                (server, hasher.finalize().into())
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().map(|(server, _)| server).collect()
    }

    fn is_overloaded(&self, server: &ServerSnapshot, average_load: f64) -> bool {
        server.active_connections as f64 > self.capacity_factor * average_load
    }

    fn select_inner(&self, healthy: &[ServerSnapshot], key: Option<&str>) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }
        if healthy.len() == 1 {
            return Some(healthy[0].clone());
        }

        let mut state = self.state.lock().unwrap();
        self.detect_scaling_events(&mut state, healthy);

        // Without request context, synthesise a pseudo-key so the walk
        // below still exercises the same admission rules.
        let key = match key {
            Some(key) => key.to_string(),
            None => format!("req_{}_{}", state.total_requests, unix_millis() % 10_000),
        };

        let ranked = Self::hrw_rank(&key, healthy);
        let average_load = healthy
            .iter()
            .map(|s| s.active_connections as f64)
            .sum::<f64>()
            / healthy.len() as f64;
        let warmup_quota =
            self.warmup_quota_factor * average_load * self.warmup_duration.as_secs_f64();

        let mut chosen: Option<&ServerSnapshot> = None;
        for &server in &ranked {
            if self.is_overloaded(server, average_load) {
                continue;
            }

            let server_state = state.servers.entry(server.key()).or_default();
            if server_state.is_new
                && server_state.warmup_start.is_some_and(|s| s.elapsed() < self.warmup_duration)
                && server_state.warmup_requests as f64 >= warmup_quota
            {
                state.warmup_redirects += 1;
                continue;
            }

            if server_state.recent_keys.contains(&key) {
                // The key is warm here; stop the walk on a cache hit.
                state.cache_hits += 1;
                chosen = Some(server);
                break;
            }

            chosen = Some(server);
            break;
        }

        // Everything overloaded: fall back to the affinity primary.
        let chosen = match chosen {
            Some(server) => server,
            None => {
                state.bounded_load_redirects += 1;
                ranked[0]
            }
        };

        let server_state = state.servers.entry(chosen.key()).or_default();
        server_state.total_requests += 1;
        server_state.remember_key(&key);
        if server_state.is_new {
            server_state.warmup_requests += 1;
        }
        state.total_requests += 1;

        Some((*chosen).clone())
    }

    /// Track joins and leaves. The first observed server set is the
    /// baseline; only servers added after that go through warm-up.
    fn detect_scaling_events(&self, state: &mut HeliosState, healthy: &[ServerSnapshot]) {
        let current: HashSet<String> = healthy.iter().map(ServerSnapshot::key).collect();
        let baseline = state.known_servers.is_empty();

        for key in current.difference(&state.known_servers) {
            let server_state = state.servers.entry(key.clone()).or_default();
            if baseline {
                continue;
            }
            server_state.is_new = true;
            server_state.warmup_start = Some(Instant::now());
            server_state.warmup_requests = 0;
            debug!(target: "ballast::strategy", server = %key, "Server joined; warm-up started");
        }

        let removed: Vec<String> = state
            .known_servers
            .difference(&current)
            .cloned()
            .collect();
        for key in removed {
            state.servers.remove(&key);
            debug!(target: "ballast::strategy", server = %key, "Server left; affinity state dropped");
        }

        state.known_servers = current;

        for server_state in state.servers.values_mut() {
            if server_state.is_new
                && server_state
                    .warmup_start
                    .is_some_and(|start| start.elapsed() >= self.warmup_duration)
            {
                server_state.is_new = false;
                server_state.warmup_start = None;
            }
        }
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

impl Default for HeliosStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for HeliosStrategy {
    fn name(&self) -> &'static str {
        "beta1"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        self.select_inner(healthy, None)
    }

    fn select_with_key(&self, healthy: &[ServerSnapshot], key: &str) -> Option<ServerSnapshot> {
        self.select_inner(healthy, Some(key))
    }

    fn metrics(&self) -> Value {
        let state = self.state.lock().unwrap();
        let total = state.total_requests.max(1) as f64;
        let warmup_servers = state
            .servers
            .values()
            .filter(|s| s.is_new && s.warmup_start.is_some())
            .count();
        json!({
            "capacity_factor": self.capacity_factor,
            "warmup_duration_sec": self.warmup_duration.as_secs(),
            "total_requests": state.total_requests,
            "cache_hit_rate": round_to(state.cache_hits as f64 / total * 100.0, 2),
            "bounded_load_redirects": state.bounded_load_redirects,
            "redirect_rate": round_to(state.bounded_load_redirects as f64 / total * 100.0, 2),
            "warmup_redirects": state.warmup_redirects,
            "warmup_redirect_rate": round_to(state.warmup_redirects as f64 / total * 100.0, 2),
            "servers_in_warmup": warmup_servers,
        })
    }

    fn server_metrics(&self, host: &str, port: u16) -> Value {
        let state = self.state.lock().unwrap();
        match state.servers.get(&server_key(host, port)) {
            Some(server) => json!({
                "total_requests": server.total_requests,
                "cached_keys_count": server.recent_keys.len(),
                "is_warming_up": server.is_new,
                "warmup_progress": round_to(server.warmup_progress(self.warmup_duration), 1),
                "warmup_requests": server.warmup_requests,
            }),
            None => json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HeliosStrategy;
    use crate::{Strategy, testutil::servers};
    use std::time::Duration;

    #[test]
    fn same_key_lands_on_the_same_server() {
        let strategy = HeliosStrategy::new();
        let list = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        let first = strategy.select_with_key(&list, "user-42").expect("non-empty");
        for _ in 0..10 {
            let next = strategy.select_with_key(&list, "user-42").expect("non-empty");
            assert_eq!(next.port, first.port);
        }
    }

    #[test]
    fn distinct_keys_keep_their_own_affinity() {
        let strategy = HeliosStrategy::new();
        let list = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        let k1 = strategy.select_with_key(&list, "k1").expect("non-empty").port;
        let k2 = strategy.select_with_key(&list, "k2").expect("non-empty").port;
        assert_eq!(strategy.select_with_key(&list, "k1").expect("non-empty").port, k1);
        assert_eq!(strategy.select_with_key(&list, "k1").expect("non-empty").port, k1);
        assert_eq!(strategy.select_with_key(&list, "k2").expect("non-empty").port, k2);

        // Repeat visits for k1 (calls 3 and 4) and k2 (call 5) are hits.
        let metrics = strategy.metrics();
        assert_eq!(metrics["cache_hit_rate"].as_f64(), Some(60.0));
        assert_eq!(metrics["total_requests"].as_u64(), Some(5));
    }

    #[test]
    fn overloaded_primary_spills_to_the_next_ranked_server() {
        let strategy = HeliosStrategy::new();
        let idle = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        let primary = strategy.select_with_key(&idle, "hot").expect("non-empty").port;

        // Load the primary past capacity_factor × mean; the key must move.
        let loaded: Vec<_> = idle
            .iter()
            .cloned()
            .map(|mut s| {
                if s.port == primary {
                    s.active_connections = 9;
                } else {
                    s.active_connections = 1;
                }
                s
            })
            .collect();
        let spilled = strategy.select_with_key(&loaded, "hot").expect("non-empty");
        assert_ne!(spilled.port, primary);
        assert_eq!(strategy.metrics()["bounded_load_redirects"].as_u64(), Some(0));
    }

    #[test]
    fn exhausted_ranking_falls_back_to_the_top_entry() {
        // Quota factor 0 keeps a warming server out of rotation entirely.
        let strategy = HeliosStrategy::with_tunables(1.25, Duration::from_secs(60), 0.0);
        let idle = servers(&[(1, 0, 0), (2, 0, 0)]);
        strategy.select_with_key(&idle, "seed").expect("non-empty");

        // A third server joins while the first two sit past the capacity
        // threshold: the walk skips every entry and falls back.
        let strained = servers(&[(1, 5, 0), (2, 5, 0), (3, 0, 0)]);
        strategy.select_with_key(&strained, "k").expect("non-empty");
        assert_eq!(strategy.metrics()["bounded_load_redirects"].as_u64(), Some(1));
        assert!(strategy.metrics()["warmup_redirects"].as_u64().is_some_and(|n| n > 0));
    }

    #[test]
    fn initial_servers_skip_warmup() {
        let strategy = HeliosStrategy::new();
        let list = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        strategy.select_with_key(&list, "k").expect("non-empty");
        assert_eq!(strategy.metrics()["servers_in_warmup"].as_u64(), Some(0));
        assert_eq!(strategy.metrics()["warmup_redirects"].as_u64(), Some(0));
    }

    #[test]
    fn joined_server_enters_warmup_and_is_quota_limited() {
        let strategy =
            HeliosStrategy::with_tunables(1.25, Duration::from_secs(60), 0.3);
        let two = servers(&[(1, 0, 0), (2, 0, 0)]);
        strategy.select_with_key(&two, "seed").expect("non-empty");

        // A third server joins; with an idle pool its warm-up quota is
        // zero, so it takes no traffic even for keys it would win.
        let three = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        for i in 0..30 {
            let picked = strategy
                .select_with_key(&three, &format!("key-{i}"))
                .expect("non-empty");
            assert_ne!(picked.port, 3);
        }
        assert_eq!(strategy.metrics()["servers_in_warmup"].as_u64(), Some(1));
        assert!(strategy.metrics()["warmup_redirects"].as_u64().is_some_and(|n| n > 0));
    }

    #[test]
    fn removed_server_drops_its_affinity_state() {
        let strategy = HeliosStrategy::new();
        let three = servers(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        strategy.select_with_key(&three, "k").expect("non-empty");

        let two = servers(&[(1, 0, 0), (2, 0, 0)]);
        strategy.select_with_key(&two, "k").expect("non-empty");
        assert_eq!(strategy.server_metrics("10.0.0.1", 3), serde_json::json!({}));
    }

    #[test]
    fn keyless_selection_still_counts_requests() {
        let strategy = HeliosStrategy::new();
        let list = servers(&[(1, 0, 0), (2, 0, 0)]);
        for _ in 0..4 {
            strategy.select(&list).expect("non-empty");
        }
        assert_eq!(strategy.metrics()["total_requests"].as_u64(), Some(4));
    }
}
