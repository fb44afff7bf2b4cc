use std::sync::Arc;
use std::time::Duration;

use ballast_pool::ServerPool;
use ballast_proxy::connect_with_timeout;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Wait between the two probe attempts of one check.
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Connect attempts per check before the server is charged a failure.
const PROBE_ATTEMPTS: u32 = 2;

/// Background prober that drives the pool's health state.
///
/// Every cycle it TCP-connects to each registered server — disabled ones
/// included, since `mark_healthy` no-ops on those — and then sleeps the
/// configured interval. Cancellation interrupts both the sweep and the
/// sleep.
pub struct HealthMonitor {
    pool: Arc<ServerPool>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(pool: Arc<ServerPool>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            pool,
            interval,
            probe_timeout,
        }
    }

    /// Start the probe loop; it runs until the token is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(
            target: "ballast::monitor",
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.probe_timeout.as_secs(),
            "Health monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.sweep() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }
        info!(target: "ballast::monitor", "Health monitor stopped");
    }

    async fn sweep(&self) {
        for server in self.pool.all_snapshot() {
            self.check_server_health(&server.host, server.port).await;
        }
    }

    /// Probe one server: a plain TCP connect, retried once after a short
    /// delay. Only a fully failed check charges a failure.
    pub async fn check_server_health(&self, host: &str, port: u16) {
        let addr = format!("{host}:{port}");
        for attempt in 1..=PROBE_ATTEMPTS {
            if connect_with_timeout(&addr, self.probe_timeout).await.is_ok() {
                self.pool.mark_healthy(host, port);
                return;
            }
            if attempt < PROBE_ATTEMPTS {
                sleep(PROBE_RETRY_DELAY).await;
            }
        }
        debug!(target: "ballast::monitor", server = %addr, "Probe failed on all attempts");
        self.pool.mark_unhealthy(host, port);
    }
}

#[cfg(test)]
mod tests {
    use super::HealthMonitor;
    use ballast_pool::ServerPool;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn monitor_for(pool: &Arc<ServerPool>) -> HealthMonitor {
        HealthMonitor::new(pool.clone(), Duration::from_secs(1), Duration::from_secs(1))
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn reachable_server_is_marked_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let pool = Arc::new(ServerPool::new(3));
        pool.add_server("127.0.0.1", port);
        // Start from a withdrawn state to observe recovery.
        for _ in 0..3 {
            pool.mark_unhealthy("127.0.0.1", port);
        }

        monitor_for(&pool).check_server_health("127.0.0.1", port).await;
        let info = pool.server_info("127.0.0.1", port).expect("registered");
        assert!(info.healthy);
        assert_eq!(info.failures, 0);
    }

    #[tokio::test]
    async fn unreachable_server_is_withdrawn_after_three_checks() {
        let port = unused_port().await;
        let pool = Arc::new(ServerPool::new(3));
        pool.add_server("127.0.0.1", port);

        let monitor = monitor_for(&pool);
        for check in 1..=3u32 {
            monitor.check_server_health("127.0.0.1", port).await;
            let info = pool.server_info("127.0.0.1", port).expect("registered");
            assert_eq!(info.failures, check);
            assert_eq!(info.healthy, check < 3);
        }
    }

    #[tokio::test]
    async fn probe_success_does_not_reenable_a_disabled_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let pool = Arc::new(ServerPool::new(3));
        pool.add_server("127.0.0.1", port);
        pool.disable("127.0.0.1", port);

        let monitor = monitor_for(&pool);
        for _ in 0..5 {
            monitor.check_server_health("127.0.0.1", port).await;
        }
        let info = pool.server_info("127.0.0.1", port).expect("registered");
        assert!(!info.healthy);
        assert!(info.manually_disabled);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_promptly() {
        let pool = Arc::new(ServerPool::new(3));
        let shutdown = CancellationToken::new();
        let handle = HealthMonitor::new(
            pool.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        )
        .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor exits within a second")
            .expect("join");
    }
}
