//! SOCKS5 front-end (RFC 1928 subset)
//!
//! Two single-shot exchanges, in order:
//! - Method selection: `VER NMETHODS METHODS`, always answered with no-auth
//! - Connect request: `VER CMD RSV ATYP DST.ADDR DST.PORT`, IPv4 CONNECT only
//!
//! Every field is read with an exact-length read driven by the header, so
//! bytes a client pipelines after the request stay in the stream for the relay.

use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use crate::error::{Result, TunnelError};
use crate::logger::log;

/// Protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// Method byte: no authentication required
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method byte: no acceptable methods
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;
const RSV: u8 = 0x00;

/// Request commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(other),
        }
    }
}

/// Reply field (REP) values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    AddressTypeNotSupported = 0x08,
}

/// A parsed CONNECT request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: Command,
    pub target: SocketAddrV4,
}

impl SocksRequest {
    /// Read `VER CMD RSV ATYP` and then the 6-byte IPv4 address and port.
    ///
    /// Validation order matches the reply a client sees: version, then
    /// command, then address type. Nothing past the header is read when the
    /// header is rejected.
    async fn read<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let command = check_header(&header)?;

        let mut addr = [0u8; 6];
        stream.read_exact(&mut addr).await?;
        Ok(Self {
            command,
            target: decode_ipv4(&addr),
        })
    }
}

fn check_header(header: &[u8; 4]) -> Result<Command> {
    if header[0] != SOCKS_VERSION {
        return Err(TunnelError::protocol(format!(
            "unexpected version {:#04x} in connect request",
            header[0]
        )));
    }
    let command = match Command::try_from(header[1]) {
        Ok(Command::Connect) => Command::Connect,
        _ => return Err(TunnelError::UnsupportedCommand(header[1])),
    };
    if header[3] != ATYP_IPV4 {
        return Err(TunnelError::UnsupportedAddressType(header[3]));
    }
    Ok(command)
}

fn decode_ipv4(buf: &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    SocketAddrV4::new(ip, port)
}

/// Encode a connect reply: `VER REP RSV ATYP BND.ADDR BND.PORT`.
///
/// `None` encodes the all-zero IPv4 bound address used by failure replies.
pub fn encode_reply(rep: Rep, bound: Option<SocketAddr>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(rep as u8);
    buf.put_u8(RSV);

    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let ip = match bound.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    match ip {
        IpAddr::V4(v4) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_u16(bound.port());
    buf
}

/// Established front-end: the live upstream stream and the request that opened it
#[derive(Debug)]
pub struct Established {
    pub upstream: TcpStream,
    pub request: SocksRequest,
}

/// SOCKS5 front-end, built once from configuration and shared by all sessions
#[derive(Debug, Clone, Copy)]
pub struct Socks5FrontEnd {
    connect_timeout: Duration,
    request_timeout: Duration,
    tcp_nodelay: bool,
}

impl Socks5FrontEnd {
    pub fn new(connect_timeout: Duration, request_timeout: Duration, tcp_nodelay: bool) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            tcp_nodelay,
        }
    }

    /// Run both exchanges on `stream` and dial the requested target.
    ///
    /// `request_timeout` bounds the client reads of both exchanges together.
    /// The target dial is bounded by `connect_timeout` alone, so a slow dial
    /// still ends in a `ConnectionRefused` reply.
    ///
    /// `local_addr` is the local address of the accepted socket; it is
    /// reported as BND.ADDR on success. On error the matching reply has
    /// already been written.
    pub async fn negotiate<S>(
        &self,
        stream: &mut S,
        peer: &str,
        local_addr: SocketAddr,
    ) -> Result<Established>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + self.request_timeout;

        timeout_at(deadline, method_selection(stream))
            .await
            .unwrap_or(Err(TunnelError::Timeout("SOCKS5 request")))
            .inspect_err(|e| {
                log::protocol(peer, "method_selection", Some(&e.to_string()));
            })?;
        log::protocol(peer, "method_selection", None);

        let established = self
            .connect(stream, local_addr, deadline)
            .await
            .inspect_err(|e| log::protocol(peer, "connect", Some(&e.to_string())))?;
        log::protocol(peer, "connect", None);
        Ok(established)
    }

    /// Connect request exchange; the request must arrive before `deadline`
    pub async fn connect<S>(
        &self,
        stream: &mut S,
        local_addr: SocketAddr,
        deadline: Instant,
    ) -> Result<Established>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match timeout_at(deadline, SocksRequest::read(stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                let rep = e.reply_code().unwrap_or(Rep::GeneralFailure);
                let _ = reply(stream, rep, None).await;
                return Err(e);
            }
            Err(_) => return Err(TunnelError::Timeout("SOCKS5 request")),
        };

        let upstream = match dial(request.target.into(), self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                reply(stream, Rep::ConnectionRefused, None).await?;
                return Err(e);
            }
        };
        if self.tcp_nodelay {
            let _ = upstream.set_nodelay(true);
        }

        reply(stream, Rep::Succeeded, Some(local_addr)).await?;
        Ok(Established { upstream, request })
    }
}

/// Method selection exchange.
///
/// Only the version byte is checked; any offered method list is answered
/// with no-auth.
pub async fn method_selection<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = match stream.read_u8().await {
        Ok(v) => v,
        Err(e) => {
            let _ = stream
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await;
            return Err(e.into());
        }
    };
    if version != SOCKS_VERSION {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(TunnelError::protocol(format!(
            "unexpected version {:#04x} in method selection",
            version
        )));
    }

    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

async fn reply<S>(stream: &mut S, rep: Rep, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(rep, bound)).await?;
    stream.flush().await?;
    Ok(())
}

/// Plain TCP dial with a connect deadline
pub async fn dial(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TunnelError::UpstreamUnreachable {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(TunnelError::UpstreamUnreachable {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}
