//! Server startup and accept loop

use crate::config::TunnelConfig;
use crate::handler::{process_connection, ConnectionMeta, Tunnel};
use crate::logger::log;

use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval; dead peers are detected in ~45s (3 probes x 15s)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
pub fn bind_listener(addr: &str, backlog: i32) -> Result<TcpListener> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address {}", addr))?;
    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

fn tune_socket(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Bind the configured address and serve until `shutdown` is cancelled
pub async fn run_server(
    tunnel: Arc<Tunnel>,
    config: &TunnelConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_listener(&config.listen, tunnel.conn_config.tcp_backlog)?;
    serve(tunnel, listener, shutdown).await
}

/// Accept loop: one task per connection, bounded by `max_connections`
pub async fn serve(
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;

    // 0 = unlimited
    let conn_limiter = if tunnel.conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(tunnel.conn_config.max_connections)))
    } else {
        None
    };

    log::info!(
        address = %local_addr,
        mode = %tunnel.mode,
        max_connections = tunnel.conn_config.max_connections,
        "Server started"
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        let peer = peer_addr.to_string();
        log::connection(&peer, "new");

        // Backpressure when at the limit
        let permit = match &conn_limiter {
            Some(limiter) => tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Shutdown requested while at connection limit");
                    break;
                }
                permit = Arc::clone(limiter).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let tunnel = Arc::clone(&tunnel);
        tokio::spawn(async move {
            let _permit = permit;
            tune_socket(&stream, tunnel.conn_config.tcp_nodelay);

            let result = match stream.local_addr() {
                Ok(local_addr) => {
                    let meta = ConnectionMeta {
                        peer_addr,
                        local_addr,
                    };
                    process_connection(&tunnel, stream, meta).await
                }
                Err(e) => Err(e.into()),
            };

            if let Err(e) = result {
                log::debug!(peer = %peer, error = %e, "Connection error");
            }
            log::connection(&peer, "closed");
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnConfig, Mode};
    use crate::tls::TrustConfig;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    #[tokio::test]
    async fn test_bind_listener_ephemeral() {
        let listener = bind_listener("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_listener_invalid_addr() {
        assert!(bind_listener("not-an-address", 16).is_err());
    }

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn trust(identity: &str) -> TrustConfig {
        let _ = rustls::crypto::ring::default_provider().install_default();
        TrustConfig::from_files(
            &fixture(&format!("{}.pem", identity)),
            &fixture(&format!("{}.key", identity)),
            &fixture("ca.pem"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    /// SOCKS tunnel limited to a single session
    fn start_limited() -> (SocketAddr, CancellationToken, JoinHandle<Result<()>>) {
        let conn_config = ConnConfig {
            max_connections: 1,
            ..ConnConfig::default()
        };
        let tunnel = Arc::new(Tunnel::new(Mode::Socks, trust("server"), conn_config));
        let listener = bind_listener("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(tunnel, listener, shutdown.clone()));
        (addr, shutdown, handle)
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// TLS dial plus method selection and CONNECT; returns the REP byte
    async fn open_session(
        addr: SocketAddr,
        target: SocketAddr,
    ) -> (tokio_rustls::client::TlsStream<TcpStream>, u8) {
        let mut tls = trust("client")
            .dial(&addr.to_string(), "localhost", Duration::from_secs(5), true)
            .await
            .unwrap();
        tls.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        tls.read_exact(&mut method).await.unwrap();

        let mut request = vec![5u8, 1, 0, 1, 127, 0, 0, 1];
        request.extend_from_slice(&target.port().to_be_bytes());
        tls.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        tls.read_exact(&mut reply).await.unwrap();
        (tls, reply[1])
    }

    #[tokio::test]
    async fn test_serve_limit_defers_second_session() {
        let target = echo_target().await;
        let (addr, shutdown, _handle) = start_limited();

        let (mut first, rep) = open_session(addr, target).await;
        assert_eq!(rep, 0);

        // Accepted by the kernel but not served while the first session holds the permit
        let mut second = tokio::spawn(open_session(addr, target));
        let pending = tokio::time::timeout(Duration::from_millis(300), &mut second).await;
        assert!(pending.is_err());

        first.shutdown().await.unwrap();
        drop(first);
        let (_second, rep) = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rep, 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_serve_shutdown_at_connection_limit() {
        let (addr, shutdown, handle) = start_limited();

        // Holds the only permit by stalling in the TLS handshake
        let _stalled = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Accepted, then parked waiting for a permit
        let _waiting = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));
    }
}
