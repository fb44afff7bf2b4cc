//! Authoritative registry of upstream servers.
//!
//! The pool is the only shared mutable state in the balancer. Every public
//! method takes the internal lock for both the mutation and any derived
//! read, and everything handed back to callers is a value copy — later
//! pool mutations are never visible through a snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

/// Newest response-time samples kept per server.
const RESPONSE_WINDOW: usize = 100;

/// Value copy of one pool entry at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub failures: u32,
    pub active_connections: u32,
    pub manually_disabled: bool,
    pub avg_response_time_ms: f64,
}

impl ServerSnapshot {
    /// Canonical `host:port` key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
struct ServerEntry {
    host: String,
    port: u16,
    healthy: bool,
    failures: u32,
    active_connections: u32,
    manually_disabled: bool,
    response_times: VecDeque<Duration>,
}

impl ServerEntry {
    fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            healthy: true,
            failures: 0,
            active_connections: 0,
            manually_disabled: false,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }

    fn eligible(&self) -> bool {
        self.healthy && !self.manually_disabled
    }

    fn average_response_time(&self) -> Duration {
        if self.response_times.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.response_times.iter().sum();
        total / self.response_times.len() as u32
    }

    fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            host: self.host.clone(),
            port: self.port,
            healthy: self.healthy,
            failures: self.failures,
            active_connections: self.active_connections,
            manually_disabled: self.manually_disabled,
            avg_response_time_ms: self.average_response_time().as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    // Insertion order drives snapshot order, so rotating strategies see a
    // stable list between calls.
    order: Vec<String>,
    servers: HashMap<String, ServerEntry>,
}

/// Thread-safe server pool.
///
/// Mutations addressed at unknown keys are silent no-ops; the health
/// monitor may race with runtime registration.
#[derive(Debug)]
pub struct ServerPool {
    inner: Mutex<PoolInner>,
    max_failures: u32,
}

impl ServerPool {
    pub fn new(max_failures: u32) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            max_failures: max_failures.max(1),
        }
    }

    /// Register an upstream. Duplicate keys are a no-op so re-adding a
    /// live server never resets its state.
    pub fn add_server(&self, host: &str, port: u16) {
        let key = server_key(host, port);
        let mut inner = self.inner.lock().unwrap();
        if inner.servers.contains_key(&key) {
            debug!(target: "ballast::pool", server = %key, "Server already registered; ignoring");
            return;
        }
        inner
            .servers
            .insert(key.clone(), ServerEntry::new(host.to_string(), port));
        inner.order.push(key.clone());
        info!(target: "ballast::pool", server = %key, "Registered upstream server");
    }

    /// Copies of all entries eligible for selection (healthy and not
    /// manually disabled), in registration order.
    pub fn healthy_snapshot(&self) -> Vec<ServerSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|key| inner.servers.get(key))
            .filter(|entry| entry.eligible())
            .map(ServerEntry::snapshot)
            .collect()
    }

    /// Copies of every entry, disabled ones included.
    pub fn all_snapshot(&self) -> Vec<ServerSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|key| inner.servers.get(key))
            .map(ServerEntry::snapshot)
            .collect()
    }

    /// Copy of a single entry, if registered.
    pub fn server_info(&self, host: &str, port: u16) -> Option<ServerSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.servers.get(&server_key(host, port)).map(ServerEntry::snapshot)
    }

    /// Record a probe failure. The server is withdrawn only once the
    /// consecutive-failure streak reaches the configured threshold.
    pub fn mark_unhealthy(&self, host: &str, port: u16) {
        let key = server_key(host, port);
        let max_failures = self.max_failures;
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&key) {
            entry.failures += 1;
            if entry.failures >= max_failures && entry.healthy {
                entry.healthy = false;
                warn!(
                    target: "ballast::pool",
                    server = %key,
                    failures = entry.failures,
                    "Upstream withdrawn after consecutive probe failures"
                );
            }
        }
    }

    /// Record a probe success. No-op while the server is manually disabled.
    pub fn mark_healthy(&self, host: &str, port: u16) {
        let key = server_key(host, port);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&key) {
            if entry.manually_disabled {
                return;
            }
            if !entry.healthy {
                info!(target: "ballast::pool", server = %key, "Upstream recovered");
            }
            entry.healthy = true;
            entry.failures = 0;
        }
    }

    /// Take a server out of rotation until `enable` is called; probe
    /// successes do not re-enable it.
    pub fn disable(&self, host: &str, port: u16) {
        let key = server_key(host, port);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&key) {
            entry.manually_disabled = true;
            entry.healthy = false;
            info!(target: "ballast::pool", server = %key, "Upstream manually disabled");
        }
    }

    /// Clear the manual override and put the server back in rotation.
    pub fn enable(&self, host: &str, port: u16) {
        let key = server_key(host, port);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&key) {
            entry.manually_disabled = false;
            entry.healthy = true;
            entry.failures = 0;
            info!(target: "ballast::pool", server = %key, "Upstream manually enabled");
        }
    }

    pub fn increment_active(&self, host: &str, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&server_key(host, port)) {
            entry.active_connections += 1;
        }
    }

    /// Decrement the active-connection count; a no-op at zero.
    pub fn decrement_active(&self, host: &str, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&server_key(host, port)) {
            if entry.active_connections > 0 {
                entry.active_connections -= 1;
            }
        }
    }

    /// Push an observed request duration; the window keeps the newest
    /// `RESPONSE_WINDOW` samples.
    pub fn record_response_time(&self, host: &str, port: u16, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.servers.get_mut(&server_key(host, port)) {
            entry.response_times.push_back(elapsed);
            if entry.response_times.len() > RESPONSE_WINDOW {
                entry.response_times.pop_front();
            }
        }
    }

    /// Arithmetic mean of the window; zero when empty or unknown.
    pub fn average_response_time(&self, host: &str, port: u16) -> Duration {
        let inner = self.inner.lock().unwrap();
        inner
            .servers
            .get(&server_key(host, port))
            .map(ServerEntry::average_response_time)
            .unwrap_or(Duration::ZERO)
    }

    /// True when the pool is non-empty and nothing is eligible.
    pub fn all_servers_down(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.servers.is_empty() {
            return false;
        }
        !inner.servers.values().any(ServerEntry::eligible)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn server_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}
