use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};

use ballast_pool::ServerPool;
use ballast_proxy::Proxy;
use ballast_strategy::Strategy;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::metrics::{Metrics, RequestRecord};

/// Reply sent when no upstream can take the request. The only bytes the
/// balancer ever authors itself; everything else is forwarded verbatim.
const UNAVAILABLE_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\n\r\nService Unavailable";

/// State shared between the accept loop, every connection handler and the
/// admin surface.
pub(crate) struct Shared {
    pub(crate) pool: Arc<ServerPool>,
    pub(crate) strategy: RwLock<Arc<dyn Strategy>>,
    pub(crate) proxy: Proxy,
    pub(crate) metrics: Metrics,
}

impl Shared {
    /// Clone of the current strategy instance. The guard is released
    /// before any await point; handlers keep using the instance they
    /// selected with even if an admin swaps the strategy mid-request.
    pub(crate) fn strategy(&self) -> Arc<dyn Strategy> {
        self.strategy.read().unwrap().clone()
    }
}

pub(crate) async fn bind_listener(listen_addr: &str) -> anyhow::Result<TcpListener> {
    info!(target: "ballast::dispatcher", listen = %listen_addr, "Binding listener");

    match TcpListener::bind(listen_addr).await {
        Ok(listener) => {
            info!(target: "ballast::dispatcher", listen = %listen_addr, "Bind() successful");
            Ok(listener)
        }
        Err(e) => {
            error!(
                target: "ballast::dispatcher",
                listen = %listen_addr,
                error = ?e,
                "Failed to bind listener"
            );
            Err(e.into())
        }
    }
}

/// Handle one accepted client connection end to end.
pub(crate) async fn handle_client(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let start = Instant::now();
    shared.metrics.request_started();

    let mut success = false;
    let mut selected: Option<String> = None;

    if shared.pool.all_servers_down() {
        warn!(target: "ballast::dispatcher", client = %addr, "All upstreams down; refusing");
        send_unavailable(&mut stream).await;
        shared.metrics.record_failure();
    } else {
        let healthy = shared.pool.healthy_snapshot();
        let strategy = shared.strategy();
        match strategy.select(&healthy) {
            None => {
                warn!(target: "ballast::dispatcher", client = %addr, "No healthy upstream; refusing");
                send_unavailable(&mut stream).await;
                shared.metrics.record_failure();
            }
            Some(server) => {
                selected = Some(server.key());
                shared.pool.increment_active(&server.host, server.port);
                let forwarded = shared
                    .proxy
                    .forward(&mut stream, &server.host, server.port)
                    .await;
                shared.pool.decrement_active(&server.host, server.port);

                match forwarded {
                    Ok(()) => {
                        success = true;
                        shared.metrics.record_success();
                        let elapsed = start.elapsed();
                        shared
                            .pool
                            .record_response_time(&server.host, server.port, elapsed);
                        strategy.record_response_time(&server.host, server.port, elapsed);
                    }
                    Err(e) => {
                        warn!(
                            target: "ballast::dispatcher",
                            client = %addr,
                            upstream = %server.key(),
                            error = %e,
                            "Upstream unreachable; refusing"
                        );
                        send_unavailable(&mut stream).await;
                        shared.metrics.record_failure();
                    }
                }
            }
        }
    }

    shared.metrics.request_finished(RequestRecord {
        timestamp: SystemTime::now(),
        server: selected,
        success,
        duration: start.elapsed(),
        client: addr.to_string(),
    });
    debug!(
        target: "ballast::dispatcher",
        client = %addr,
        success,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Connection finished"
    );
}

async fn send_unavailable(stream: &mut TcpStream) {
    let _ = stream.write_all(UNAVAILABLE_RESPONSE).await;
}
