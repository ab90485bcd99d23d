//! Connection handling logic
//!
//! One pipeline per front-end. Each owns the accepted stream, opens the
//! second side, and hands both to the relay. If the second side cannot be
//! opened the accepted stream is dropped without relaying.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{ConnConfig, Mode};
use crate::error::{Result, TunnelError};
use crate::logger::log;
use crate::relay::{relay, CopyResult};
use crate::socks5::{self, Socks5FrontEnd};
use crate::tls::TrustConfig;

/// Everything a session needs, built once and shared read-only
pub struct Tunnel {
    pub mode: Mode,
    pub trust: TrustConfig,
    pub socks: Socks5FrontEnd,
    pub conn_config: ConnConfig,
}

impl Tunnel {
    pub fn new(mode: Mode, trust: TrustConfig, conn_config: ConnConfig) -> Self {
        Self {
            mode,
            trust,
            socks: Socks5FrontEnd::new(
                conn_config.connect_timeout,
                conn_config.request_timeout,
                conn_config.tcp_nodelay,
            ),
            conn_config,
        }
    }
}

/// Connection metadata
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Local address of the accepted socket
    pub local_addr: SocketAddr,
}

/// Process a single accepted connection according to the tunnel mode
pub async fn process_connection(
    tunnel: &Tunnel,
    stream: TcpStream,
    meta: ConnectionMeta,
) -> Result<CopyResult> {
    match &tunnel.mode {
        Mode::Client {
            remote,
            server_name,
        } => handle_client(tunnel, stream, meta, remote, server_name).await,
        Mode::Server { upstream } => {
            let tls = tunnel.trust.accept(stream).await?;
            log::debug!(peer = %meta.peer_addr, "TLS handshake successful");
            handle_forward(tunnel, tls, meta, upstream).await
        }
        Mode::Socks => {
            let tls = tunnel.trust.accept(stream).await?;
            log::debug!(peer = %meta.peer_addr, "TLS handshake successful");
            handle_socks(tunnel, tls, meta).await
        }
    }
}

/// Plaintext in, mutual TLS out
async fn handle_client(
    tunnel: &Tunnel,
    downstream: TcpStream,
    meta: ConnectionMeta,
    remote: &str,
    server_name: &str,
) -> Result<CopyResult> {
    let conn = &tunnel.conn_config;
    let upstream = tunnel
        .trust
        .dial(remote, server_name, conn.connect_timeout, conn.tcp_nodelay)
        .await?;
    log::debug!(peer = %meta.peer_addr, remote = %remote, "Tunnel established");

    splice(tunnel, downstream, upstream, meta).await
}

/// Relay an already-terminated stream to the fixed upstream
pub async fn handle_forward<S>(
    tunnel: &Tunnel,
    downstream: S,
    meta: ConnectionMeta,
    upstream: &str,
) -> Result<CopyResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = &tunnel.conn_config;
    let addr = tokio::net::lookup_host(upstream)
        .await
        .map_err(|source| TunnelError::UpstreamUnreachable {
            addr: upstream.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| TunnelError::UpstreamUnreachable {
            addr: upstream.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        })?;
    let target = socks5::dial(addr, conn.connect_timeout).await?;
    if conn.tcp_nodelay {
        let _ = target.set_nodelay(true);
    }
    log::debug!(peer = %meta.peer_addr, upstream = %upstream, "Upstream connected");

    splice(tunnel, downstream, target, meta).await
}

/// SOCKS5 negotiation, then relay
pub async fn handle_socks<S>(
    tunnel: &Tunnel,
    mut downstream: S,
    meta: ConnectionMeta,
) -> Result<CopyResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = meta.peer_addr.to_string();
    let established = tunnel
        .socks
        .negotiate(&mut downstream, &peer, meta.local_addr)
        .await?;

    log::debug!(peer = %peer, target = %established.request.target, "Connecting to target");
    splice(tunnel, downstream, established.upstream, meta).await
}

async fn splice<A, B>(tunnel: &Tunnel, a: A, b: B, meta: ConnectionMeta) -> Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let conn = &tunnel.conn_config;
    let result = relay(a, b, conn.buffer_size, conn.idle_timeout).await?;
    if result.completed {
        log::debug!(
            peer = %meta.peer_addr,
            upload = result.a_to_b,
            download = result.b_to_a,
            "Relay finished"
        );
    } else {
        log::debug!(
            peer = %meta.peer_addr,
            upload = result.a_to_b,
            download = result.b_to_a,
            "Relay idle timeout"
        );
    }
    Ok(result)
}
