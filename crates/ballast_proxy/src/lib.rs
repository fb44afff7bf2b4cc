//! Upstream TCP connect and bidirectional byte splice.
//!
//! The proxy never parses what flows through it. Once the upstream
//! connect succeeds the request counts as handled, whatever happens to
//! the byte stream afterwards — a half-duplex close is a normal end of
//! conversation, and mid-stream errors surface to the client only as
//! whatever the upstream already sent.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Per-direction copy buffer.
const SPLICE_BUF: usize = 4096;

/// An idle interval this long with no readable data ends the splice.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream connect to {addr} timed out")]
    ConnectTimeout { addr: String },
}

/// Connect to an upstream with a timeout.
pub async fn connect_with_timeout(addr: &str, timeout_dur: Duration) -> Result<TcpStream, ProxyError> {
    match timeout(timeout_dur, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::ConnectTimeout {
            addr: addr.to_string(),
        }),
    }
}

pub struct Proxy {
    connect_timeout: Duration,
}

impl Proxy {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open the upstream and shuttle bytes both ways until both sides
    /// close, an idle interval expires, or either side errors.
    ///
    /// An `Err` means the upstream was unreachable; any later stream
    /// trouble is logged and swallowed — the upstream was reached, so the
    /// caller accounts the request as handled.
    #[instrument(skip(self, client), fields(upstream = %format!("{host}:{port}")))]
    pub async fn forward(
        &self,
        client: &mut TcpStream,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let addr = format!("{host}:{port}");
        let mut upstream = connect_with_timeout(&addr, self.connect_timeout).await?;
        debug!(target: "ballast::proxy", upstream = %addr, "Upstream connected; splicing");
        splice(client, &mut upstream, &addr).await;
        Ok(())
    }
}

enum Transfer {
    FromClient(std::io::Result<usize>),
    FromUpstream(std::io::Result<usize>),
}

async fn splice(client: &mut TcpStream, upstream: &mut TcpStream, addr: &str) {
    let mut client_buf = [0u8; SPLICE_BUF];
    let mut upstream_buf = [0u8; SPLICE_BUF];
    let mut client_open = true;
    let mut upstream_open = true;

    while client_open || upstream_open {
        let waited = timeout(IDLE_READ_TIMEOUT, async {
            tokio::select! {
                res = client.read(&mut client_buf), if client_open => Transfer::FromClient(res),
                res = upstream.read(&mut upstream_buf), if upstream_open => Transfer::FromUpstream(res),
            }
        })
        .await;

        match waited {
            Ok(Transfer::FromClient(Ok(0))) => {
                client_open = false;
                let _ = upstream.shutdown().await;
            }
            Ok(Transfer::FromClient(Ok(n))) => {
                if let Err(e) = upstream.write_all(&client_buf[..n]).await {
                    debug!(target: "ballast::proxy", upstream = %addr, error = ?e, "Upstream write failed");
                    return;
                }
            }
            Ok(Transfer::FromUpstream(Ok(0))) => {
                upstream_open = false;
                let _ = client.shutdown().await;
            }
            Ok(Transfer::FromUpstream(Ok(n))) => {
                if let Err(e) = client.write_all(&upstream_buf[..n]).await {
                    debug!(target: "ballast::proxy", upstream = %addr, error = ?e, "Client write failed");
                    return;
                }
            }
            Ok(Transfer::FromClient(Err(e))) | Ok(Transfer::FromUpstream(Err(e))) => {
                debug!(target: "ballast::proxy", upstream = %addr, error = ?e, "Read failed; ending splice");
                return;
            }
            Err(_) => {
                warn!(target: "ballast::proxy", upstream = %addr, "Splice idle timeout; closing");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Proxy, ProxyError};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Echo upstream: reads to EOF, writes everything back, closes.
    async fn spawn_echo_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    if sock.read_to_end(&mut data).await.is_ok() {
                        let _ = sock.write_all(&data).await;
                    }
                });
            }
        });
        port
    }

    /// Proxy front door: every accepted connection is forwarded to the
    /// given upstream.
    async fn spawn_proxy_front(upstream_port: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind front");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let proxy = Proxy::new(Duration::from_secs(3));
                    let _ = proxy.forward(&mut sock, "127.0.0.1", upstream_port).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn relays_bytes_exactly_both_ways() {
        let upstream_port = spawn_echo_upstream().await;
        let front_port = spawn_proxy_front(upstream_port).await;

        let mut client = TcpStream::connect(("127.0.0.1", front_port))
            .await
            .expect("connect front");
        let payload = b"GET /\r\n\r\n";
        client.write_all(payload).await.expect("send");
        client.shutdown().await.expect("half close");

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.expect("read echo");
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn relays_large_payloads_across_buffer_boundaries() {
        let upstream_port = spawn_echo_upstream().await;
        let front_port = spawn_proxy_front(upstream_port).await;

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let mut client = TcpStream::connect(("127.0.0.1", front_port))
            .await
            .expect("connect front");
        client.write_all(&payload).await.expect("send");
        client.shutdown().await.expect("half close");

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.expect("read echo");
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn refused_upstream_reports_connect_error() {
        // Bind then drop to find a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let dead_port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let front = TcpListener::bind("127.0.0.1:0").await.expect("bind front");
        let front_addr = front.local_addr().expect("local addr");
        let client = tokio::spawn(async move {
            let _ = TcpStream::connect(front_addr).await.expect("connect front");
            // Keep the socket alive until the proxy gives up.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (mut sock, _) = front.accept().await.expect("accept");
        let proxy = Proxy::new(Duration::from_secs(1));
        let err = proxy
            .forward(&mut sock, "127.0.0.1", dead_port)
            .await
            .expect_err("upstream is down");
        assert!(matches!(
            err,
            ProxyError::Connect { .. } | ProxyError::ConnectTimeout { .. }
        ));
        client.await.expect("client task");
    }

    #[tokio::test]
    async fn upstream_close_without_bytes_still_counts_as_handled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let upstream_port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            // Accept and slam the door.
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            drop(sock);
        });

        let front = TcpListener::bind("127.0.0.1:0").await.expect("bind front");
        let front_addr = front.local_addr().expect("local addr");
        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(front_addr).await.expect("connect front");
            let mut buf = Vec::new();
            let _ = sock.read_to_end(&mut buf).await;
        });

        let (mut sock, _) = front.accept().await.expect("accept");
        let proxy = Proxy::new(Duration::from_secs(3));
        proxy
            .forward(&mut sock, "127.0.0.1", upstream_port)
            .await
            .expect("connect succeeded, so the request counts as handled");
        client.await.expect("client task");
    }
}
