use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ballast_pool::{ServerSnapshot, server_key};
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tracing::debug;

use crate::Strategy;

/// EWMA smoothing factor: 30% new observation, 70% history.
const EWMA_ALPHA: f64 = 0.3;
/// Abstract work units attributed to one in-flight connection.
const WORK_PER_CONNECTION: f64 = 10.0;
/// Head-request age saturates here, in seconds.
const HEAD_AGE_CAP_SECS: f64 = 5.0;
/// Per-server latency samples kept for the interference signal.
const SERVER_WINDOW: usize = 100;
/// Minimum window before variance is trusted as interference.
const INTERFERENCE_MIN_SAMPLES: usize = 5;
/// Global latency samples kept for the p99 estimate.
const LATENCY_RING: usize = 1000;
/// Selections between feedback-control adjustments.
const FEEDBACK_INTERVAL: u32 = 100;
/// Ring samples required before feedback control may adjust weights.
const FEEDBACK_MIN_SAMPLES: usize = 100;

const DEFAULT_SLO_MS: f64 = 100.0;
const DEFAULT_HEDGE_MULTIPLIER: f64 = 1.5;

/// AURA — tail-latency selection.
///
/// Power-of-two choices over a composite risk score
/// `risk = workEWMA + β·interference + γ·headAge`, with the β/γ weights
/// steered by a feedback loop that watches the observed global p99
/// against a target just below the SLO.
pub struct AuraStrategy {
    slo_threshold_ms: f64,
    hedge_multiplier: f64,
    target_p99_ms: f64,
    state: Mutex<AuraState>,
}

struct AuraState {
    beta: f64,
    gamma: f64,
    servers: HashMap<String, ServerState>,
    recent_latencies: VecDeque<f64>,
    feedback_countdown: u32,
    total_requests: u64,
    hedge_count: u64,
}

struct ServerState {
    work_ewma: f64,
    interference: f64,
    head_age: f64,
    last_update: Instant,
    response_times: VecDeque<f64>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            work_ewma: 0.0,
            interference: 0.0,
            head_age: 0.0,
            last_update: Instant::now(),
            response_times: VecDeque::with_capacity(SERVER_WINDOW),
        }
    }

    fn p99_ms(&self) -> f64 {
        percentile_99(self.response_times.iter().copied())
    }
}

fn percentile_99(samples: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = samples.collect();
    if sorted.len() < 10 {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let index = ((sorted.len() as f64) * 0.99) as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

impl AuraStrategy {
    pub fn new() -> Self {
        Self::with_slo(DEFAULT_SLO_MS, DEFAULT_HEDGE_MULTIPLIER)
    }

    pub fn with_slo(slo_threshold_ms: f64, hedge_multiplier: f64) -> Self {
        Self {
            slo_threshold_ms,
            hedge_multiplier,
            target_p99_ms: slo_threshold_ms * 0.9,
            state: Mutex::new(AuraState {
                beta: 0.3,
                gamma: 0.4,
                servers: HashMap::new(),
                recent_latencies: VecDeque::with_capacity(LATENCY_RING),
                feedback_countdown: FEEDBACK_INTERVAL,
                total_requests: 0,
                hedge_count: 0,
            }),
        }
    }

    /// Design hook for dispatch-level hedging: would a request with the
    /// given service-time estimate blow through the SLO on this server?
    /// Not consulted by the dispatcher; exposed for callers that hedge.
    pub fn should_hedge(&self, host: &str, port: u16, estimated_service_ms: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        let work_ewma = state
            .servers
            .entry(server_key(host, port))
            .or_insert_with(ServerState::new)
            .work_ewma;
        let predicted_finish_ms = work_ewma + estimated_service_ms;
        if predicted_finish_ms > self.slo_threshold_ms * self.hedge_multiplier {
            state.hedge_count += 1;
            return true;
        }
        false
    }
}

impl AuraState {
    /// `risk = workEWMA + β·interference + γ·headAge`.
    fn tail_risk(&mut self, key: String) -> f64 {
        let beta = self.beta;
        let gamma = self.gamma;
        let state = self.servers.entry(key).or_insert_with(ServerState::new);
        state.work_ewma + beta * state.interference + gamma * state.head_age
    }

    /// Fold the new assignment into the chosen server's queue model.
    fn update_server(&mut self, server: &ServerSnapshot) {
        let state = self
            .servers
            .entry(server.key())
            .or_insert_with(ServerState::new);
        let now = Instant::now();

        let current_work = server.active_connections as f64 * WORK_PER_CONNECTION;
        state.work_ewma = EWMA_ALPHA * current_work + (1.0 - EWMA_ALPHA) * state.work_ewma;

        // Latency variance as an interference proxy: volatile response
        // times suggest CPU contention or noisy neighbours.
        if state.response_times.len() >= INTERFERENCE_MIN_SAMPLES {
            let times = &state.response_times;
            let mean = times.iter().sum::<f64>() / times.len() as f64;
            let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / times.len() as f64;
            state.interference = (variance / 1000.0).min(10.0);
        } else {
            state.interference = 0.0;
        }

        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        if server.active_connections > 0 {
            state.head_age = (state.head_age + elapsed).min(HEAD_AGE_CAP_SECS);
        } else {
            state.head_age = 0.0;
        }
        state.last_update = now;
    }

    /// Steer β/γ toward the target p99: raise sensitivity while the tail
    /// is over target, decay it while comfortably under.
    fn adjust_weights(&mut self, target_p99_ms: f64) {
        if self.recent_latencies.len() < FEEDBACK_MIN_SAMPLES {
            return;
        }
        let current_p99 = percentile_99(self.recent_latencies.iter().copied());
        if current_p99 > target_p99_ms {
            self.beta = (self.beta * 1.1).min(1.0);
            self.gamma = (self.gamma * 1.1).min(1.0);
        } else {
            self.beta = (self.beta * 0.95).max(0.1);
            self.gamma = (self.gamma * 0.95).max(0.1);
        }
        debug!(
            target: "ballast::strategy",
            p99_ms = current_p99,
            beta = self.beta,
            gamma = self.gamma,
            "Feedback control adjusted risk weights"
        );
    }
}

impl Default for AuraStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for AuraStrategy {
    fn name(&self) -> &'static str {
        "alpha1"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }
        if healthy.len() == 1 {
            return Some(healthy[0].clone());
        }

        let mut state = self.state.lock().unwrap();
        let mut rng = rand::thread_rng();

        // Two-choice sampling: evaluate risk on a random pair instead of
        // the whole pool.
        let s1 = healthy.choose(&mut rng)?;
        let mut s2 = healthy.choose(&mut rng)?;
        let mut attempts = 0;
        while s1.key() == s2.key() && attempts < 3 {
            s2 = healthy.choose(&mut rng)?;
            attempts += 1;
        }

        let score1 = state.tail_risk(s1.key());
        let score2 = state.tail_risk(s2.key());
        let primary = if score1 <= score2 { s1 } else { s2 };

        state.update_server(primary);
        state.total_requests += 1;

        state.feedback_countdown -= 1;
        if state.feedback_countdown == 0 {
            state.adjust_weights(self.target_p99_ms);
            state.feedback_countdown = FEEDBACK_INTERVAL;
        }

        Some(primary.clone())
    }

    fn record_response_time(&self, host: &str, port: u16, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap();

        if let Some(server) = state.servers.get_mut(&server_key(host, port)) {
            server.response_times.push_back(elapsed_ms);
            if server.response_times.len() > SERVER_WINDOW {
                server.response_times.pop_front();
            }
        }

        state.recent_latencies.push_back(elapsed_ms);
        if state.recent_latencies.len() > LATENCY_RING {
            state.recent_latencies.pop_front();
        }
    }

    fn metrics(&self) -> Value {
        let state = self.state.lock().unwrap();
        let hedge_rate = (state.hedge_count as f64 / state.total_requests.max(1) as f64) * 100.0;
        json!({
            "beta": round_to(state.beta, 3),
            "gamma": round_to(state.gamma, 3),
            "hedge_rate": round_to(hedge_rate, 2),
            "total_requests": state.total_requests,
            "current_p99_ms": round_to(percentile_99(state.recent_latencies.iter().copied()), 2),
            "target_p99_ms": self.target_p99_ms,
            "slo_threshold_ms": self.slo_threshold_ms,
        })
    }

    fn server_metrics(&self, host: &str, port: u16) -> Value {
        let state = self.state.lock().unwrap();
        match state.servers.get(&server_key(host, port)) {
            Some(server) => json!({
                "work_queue_ewma": round_to(server.work_ewma, 2),
                "interference_signal": round_to(server.interference, 3),
                "head_request_age": round_to(server.head_age, 3),
                "server_p99_ms": round_to(server.p99_ms(), 2),
            }),
            None => json!({}),
        }
    }
}
