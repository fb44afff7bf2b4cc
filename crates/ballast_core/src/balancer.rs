use std::sync::{Arc, RwLock};
use std::time::Duration;

use ballast_config::{BallastConfig, StrategyKind, parse_server_addr};
use ballast_pool::{ServerPool, ServerSnapshot};
use ballast_proxy::Proxy;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher::{Shared, bind_listener, handle_client};
use crate::metrics::{Metrics, PerformanceSnapshot};
use crate::monitor::HealthMonitor;

/// How long in-flight connections get to drain after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Overall state for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub strategy: String,
    pub total_servers: usize,
    pub healthy_servers: usize,
}

/// The load balancer: pool, strategy, proxy, monitor and dispatcher under
/// one lifecycle, plus the admin surface the dashboard collaborator uses.
pub struct Balancer {
    cfg: BallastConfig,
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    max_workers: u32,
    shutdown: CancellationToken,
}

impl Balancer {
    pub fn new(cfg: BallastConfig) -> Self {
        let kind = StrategyKind::parse(&cfg.strategy).unwrap_or_else(|| {
            warn!(
                target: "ballast::dispatcher",
                strategy = %cfg.strategy,
                "Unknown strategy; falling back to round_robin"
            );
            StrategyKind::RoundRobin
        });

        let pool = Arc::new(ServerPool::new(cfg.max_failures));
        for addr in cfg.servers.normalized() {
            match parse_server_addr(&addr) {
                Some((host, port)) => pool.add_server(&host, port),
                None => warn!(
                    target: "ballast::dispatcher",
                    server = %addr,
                    "Ignoring malformed server address"
                ),
            }
        }

        let shared = Arc::new(Shared {
            pool,
            strategy: RwLock::new(ballast_strategy::build(kind)),
            proxy: Proxy::new(cfg.timeout()),
            metrics: Metrics::new(),
        });

        let max_workers = cfg.max_workers.max(1);
        Self {
            cfg,
            shared,
            semaphore: Arc::new(Semaphore::new(max_workers as usize)),
            max_workers,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the accept socket on the configured port.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        bind_listener(&format!("0.0.0.0:{}", self.cfg.listen_port)).await
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until `shutdown` is called,
    /// then drain in-flight connections for a bounded grace period.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            target: "ballast::dispatcher",
            strategy = %self.strategy_name(),
            servers = self.shared.pool.len(),
            max_workers = self.max_workers,
            "Load balancer starting"
        );

        let monitor = HealthMonitor::new(
            self.shared.pool.clone(),
            self.cfg.health_check_interval(),
            self.cfg.timeout(),
        )
        .spawn(self.shutdown.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(target: "ballast::dispatcher", error = ?e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let permit = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        permit = self.semaphore.clone().acquire_owned() => {
                            match permit {
                                Ok(p) => p,
                                Err(_) => break,
                            }
                        }
                    };

                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_client(shared, stream, addr).await;
                    });
                }
            }
        }

        // Stop accepting, then wait for the workers to hand their permits
        // back before tearing sockets down.
        drop(listener);
        if timeout(SHUTDOWN_GRACE, self.semaphore.acquire_many(self.max_workers))
            .await
            .is_err()
        {
            warn!(
                target: "ballast::dispatcher",
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Grace period expired with connections still in flight"
            );
        }
        let _ = monitor.await;
        info!(target: "ballast::dispatcher", "Load balancer stopped");
        Ok(())
    }

    /// Signal every loop to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ---------------------------------------------------
    // Admin surface (consumed by the dashboard collaborator)
    // ---------------------------------------------------

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: !self.shutdown.is_cancelled(),
            strategy: self.strategy_name(),
            total_servers: self.shared.pool.len(),
            healthy_servers: self.shared.pool.healthy_snapshot().len(),
        }
    }

    pub fn servers(&self) -> Vec<ServerSnapshot> {
        self.shared.pool.all_snapshot()
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        self.shared.metrics.performance()
    }

    pub fn strategy_name(&self) -> String {
        self.shared.strategy().name().to_string()
    }

    pub fn strategy_metrics(&self) -> Value {
        self.shared.strategy().metrics()
    }

    pub fn server_strategy_metrics(&self, host: &str, port: u16) -> Value {
        self.shared.strategy().server_metrics(host, port)
    }

    /// Replace the selection policy. Per-strategy state starts fresh.
    pub fn set_strategy(&self, kind: StrategyKind) {
        let strategy = ballast_strategy::build(kind);
        *self.shared.strategy.write().unwrap() = strategy;
        info!(target: "ballast::dispatcher", strategy = %kind, "Strategy replaced");
    }

    pub fn add_server(&self, host: &str, port: u16) {
        self.shared.pool.add_server(host, port);
    }

    pub fn disable_server(&self, host: &str, port: u16) {
        self.shared.pool.disable(host, port);
    }

    pub fn enable_server(&self, host: &str, port: u16) {
        self.shared.pool.enable(host, port);
    }

    /// Direct pool access for collaborators that outlive the balancer
    /// facade (tests, embedding services).
    pub fn pool(&self) -> Arc<ServerPool> {
        self.shared.pool.clone()
    }
}
