use std::sync::Arc;

use ballast_config::BallastConfig;
use ballast_core::Balancer;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ballast=debug,ballast_core=debug,ballast_proxy=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_ids(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = BallastConfig::from_file_or_default("ballast.conf");
    cfg.print();

    let balancer = Arc::new(Balancer::new(cfg));

    let interrupted = balancer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "ballast", "Interrupt received; shutting down");
            interrupted.shutdown();
        }
    });

    balancer.run().await
}
