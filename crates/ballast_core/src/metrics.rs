use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

/// Completed requests remembered for the dashboard.
const RECENT_RING: usize = 100;

/// Slice of the ring exposed through the performance snapshot.
const RECENT_EXPOSED: usize = 10;

/// One completed (or refused) client request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    #[serde(serialize_with = "as_unix_seconds")]
    pub timestamp: SystemTime,
    /// `host:port` of the chosen upstream; `None` when nothing was
    /// selectable.
    pub server: Option<String>,
    pub success: bool,
    #[serde(serialize_with = "as_seconds")]
    pub duration: Duration,
    pub client: String,
}

fn as_unix_seconds<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    s.serialize_f64(secs)
}

fn as_seconds<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Read-only totals handed to dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_connections: u32,
    pub uptime_seconds: f64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub requests_per_minute: f64,
    pub server_request_counts: HashMap<String, u64>,
    pub recent_requests: Vec<RequestRecord>,
}

/// Dispatcher-owned counters and the recent-request ring.
///
/// Guarded by its own lock, distinct from the pool's.
pub struct Metrics {
    started_at: Instant,
    per_server: DashMap<String, u64>,
    inner: Mutex<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    active_connections: u32,
    recent: Vec<RequestRecord>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            per_server: DashMap::new(),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    /// A client connection entered the handler.
    pub fn request_started(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        inner.active_connections += 1;
    }

    pub fn record_success(&self) {
        self.inner.lock().unwrap().successful_requests += 1;
    }

    pub fn record_failure(&self) {
        self.inner.lock().unwrap().failed_requests += 1;
    }

    /// The handler is done with a connection: release the gauge, push the
    /// record into the ring and bump the per-server counter.
    pub fn request_finished(&self, record: RequestRecord) {
        if let Some(server) = &record.server {
            *self.per_server.entry(server.clone()).or_insert(0) += 1;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.active_connections > 0 {
            inner.active_connections -= 1;
        }
        inner.recent.push(record);
        if inner.recent.len() > RECENT_RING {
            inner.recent.remove(0);
        }
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        let uptime = self.started_at.elapsed().as_secs_f64();
        let server_request_counts: HashMap<String, u64> = self
            .per_server
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let inner = self.inner.lock().unwrap();
        let finished = inner.successful_requests + inner.failed_requests;
        let success_rate =
            (inner.successful_requests as f64 / finished.max(1) as f64) * 100.0;

        let recent_success_ms: Vec<f64> = inner
            .recent
            .iter()
            .filter(|r| r.success)
            .map(|r| r.duration.as_secs_f64() * 1000.0)
            .collect();
        let avg_response_time_ms = if recent_success_ms.is_empty() {
            0.0
        } else {
            recent_success_ms.iter().sum::<f64>() / recent_success_ms.len() as f64
        };

        let requests_per_minute =
            inner.total_requests as f64 / (uptime / 60.0).max(1.0);

        let recent_requests: Vec<RequestRecord> = inner
            .recent
            .iter()
            .rev()
            .take(RECENT_EXPOSED)
            .rev()
            .cloned()
            .collect();

        PerformanceSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            active_connections: inner.active_connections,
            uptime_seconds: (uptime * 10.0).round() / 10.0,
            success_rate: (success_rate * 10.0).round() / 10.0,
            avg_response_time_ms: (avg_response_time_ms * 100.0).round() / 100.0,
            requests_per_minute: (requests_per_minute * 10.0).round() / 10.0,
            server_request_counts,
            recent_requests,
        }
    }

    /// Requests routed to one upstream since startup.
    pub fn server_request_count(&self, server_key: &str) -> u64 {
        self.per_server.get(server_key).map(|v| *v).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Metrics, RequestRecord};
    use std::time::{Duration, SystemTime};

    fn record(server: Option<&str>, success: bool, millis: u64) -> RequestRecord {
        RequestRecord {
            timestamp: SystemTime::now(),
            server: server.map(String::from),
            success,
            duration: Duration::from_millis(millis),
            client: "127.0.0.1:50000".to_string(),
        }
    }

    #[test]
    fn counters_add_up() {
        let metrics = Metrics::new();
        for _ in 0..3 {
            metrics.request_started();
        }
        metrics.record_success();
        metrics.record_success();
        metrics.record_failure();
        metrics.request_finished(record(Some("a:1"), true, 10));
        metrics.request_finished(record(Some("a:1"), true, 30));
        metrics.request_finished(record(Some("b:2"), false, 5));

        let perf = metrics.performance();
        assert_eq!(perf.total_requests, 3);
        assert_eq!(perf.successful_requests, 2);
        assert_eq!(perf.failed_requests, 1);
        assert_eq!(perf.active_connections, 0);
        assert_eq!(perf.success_rate, 66.7);
        assert_eq!(perf.avg_response_time_ms, 20.0);
        assert_eq!(perf.server_request_counts.get("a:1"), Some(&2));
        assert_eq!(perf.server_request_counts.get("b:2"), Some(&1));
    }

    #[test]
    fn ring_keeps_the_newest_hundred_and_exposes_ten() {
        let metrics = Metrics::new();
        for i in 0..120u64 {
            metrics.request_started();
            metrics.record_success();
            metrics.request_finished(record(Some("a:1"), true, i));
        }
        let perf = metrics.performance();
        assert_eq!(perf.recent_requests.len(), 10);
        // Newest records survive; the exposed slice ends at the very last.
        let last = perf.recent_requests.last().expect("ten records");
        assert_eq!(last.duration, Duration::from_millis(119));
        // Ring mean covers samples 20..120.
        assert_eq!(perf.avg_response_time_ms, 69.5);
    }

    #[test]
    fn failed_only_traffic_reports_zero_success_rate() {
        let metrics = Metrics::new();
        metrics.request_started();
        metrics.record_failure();
        metrics.request_finished(record(None, false, 0));
        let perf = metrics.performance();
        assert_eq!(perf.success_rate, 0.0);
        assert_eq!(perf.avg_response_time_ms, 0.0);
        assert!(perf.server_request_counts.is_empty());
    }
}
