use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use ballast_pool::{ServerSnapshot, server_key};
use rand::seq::SliceRandom;

use crate::Strategy;

/// Newest latency samples kept per server.
const SAMPLE_WINDOW: usize = 100;

/// Chance of probing a server that has no samples yet.
const EXPLORE_PROBABILITY: f64 = 0.2;

/// Recent-response-time-biased selection.
///
/// Picks the server with the lowest mean latency over its recent window.
/// Servers without samples are bootstrapped: round robin while nobody has
/// data, and an occasional random probe once some do.
pub struct ResponseTimeStrategy {
    state: Mutex<RtState>,
}

#[derive(Default)]
struct RtState {
    windows: HashMap<String, VecDeque<Duration>>,
    rr_cursor: usize,
}

impl RtState {
    fn average(&self, key: &str) -> Option<Duration> {
        let window = self.windows.get(key)?;
        if window.is_empty() {
            return None;
        }
        let total: Duration = window.iter().sum();
        Some(total / window.len() as u32)
    }
}

impl ResponseTimeStrategy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RtState::default()),
        }
    }
}

impl Default for ResponseTimeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for ResponseTimeStrategy {
    fn name(&self) -> &'static str {
        "response_time"
    }

    fn select(&self, healthy: &[ServerSnapshot]) -> Option<ServerSnapshot> {
        if healthy.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap();

        let mut with_data: Vec<(&ServerSnapshot, Duration)> = Vec::new();
        let mut without_data: Vec<&ServerSnapshot> = Vec::new();
        for server in healthy {
            match state.average(&server.key()) {
                Some(avg) => with_data.push((server, avg)),
                None => without_data.push(server),
            }
        }

        // Nobody has samples yet: plain rotation to build initial data.
        if with_data.is_empty() {
            state.rr_cursor = (state.rr_cursor + 1) % healthy.len();
            return Some(healthy[state.rr_cursor].clone());
        }

        // Give sample-less servers an occasional turn so they ever get a
        // window at all.
        if !without_data.is_empty() && rand::random::<f64>() < EXPLORE_PROBABILITY {
            let mut rng = rand::thread_rng();
            return without_data.choose(&mut rng).map(|s| (*s).clone());
        }

        with_data
            .into_iter()
            .min_by_key(|(_, avg)| *avg)
            .map(|(server, _)| server.clone())
    }

    fn record_response_time(&self, host: &str, port: u16, elapsed: Duration) {
        let mut state = self.state.lock().unwrap();
        let window = state.windows.entry(server_key(host, port)).or_default();
        window.push_back(elapsed);
        if window.len() > SAMPLE_WINDOW {
            window.pop_front();
        }
    }
}
