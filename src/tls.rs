//! Mutual-TLS trust handshake
//!
//! Loads the local identity and the trust anchor set once at startup and
//! builds both sides of the handshake from them:
//! - initiator: verifies the server chain against the anchors, presents the identity
//! - responder: requires a client certificate that chains to the anchors

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{Result, TunnelError};

/// Minimum protocol version is TLS 1.2
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Local certificate chain and private key
#[derive(Debug)]
pub struct Identity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Load a PEM certificate chain and PEM private key
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_file = File::open(cert_path).map_err(|e| {
            TunnelError::config(format!("cannot open {}: {}", cert_path.display(), e))
        })?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                TunnelError::config(format!("invalid PEM in {}: {}", cert_path.display(), e))
            })?;
        if certs.is_empty() {
            return Err(TunnelError::config(format!(
                "No certificates found in {}",
                cert_path.display()
            )));
        }

        let key_file = File::open(key_path).map_err(|e| {
            TunnelError::config(format!("cannot open {}: {}", key_path.display(), e))
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| {
                TunnelError::config(format!("invalid PEM in {}: {}", key_path.display(), e))
            })?
            .ok_or_else(|| {
                TunnelError::config(format!("No private key found in {}", key_path.display()))
            })?;

        Ok(Self { certs, key })
    }
}

/// Load the trusted issuer bundle
pub fn load_trust_anchors(ca_path: &Path) -> Result<RootCertStore> {
    let ca_file = File::open(ca_path)
        .map_err(|e| TunnelError::config(format!("cannot open {}: {}", ca_path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(ca_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::config(format!("invalid PEM in {}: {}", ca_path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(TunnelError::config(format!(
            "No usable CA certificates found in {}",
            ca_path.display()
        )));
    }
    Ok(roots)
}

/// Immutable trust material shared by every session
#[derive(Clone)]
pub struct TrustConfig {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
    handshake_timeout: Duration,
}

impl TrustConfig {
    /// Build both handshake roles from an identity and an anchor set
    pub fn new(
        identity: Identity,
        anchors: RootCertStore,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let anchors = Arc::new(anchors);

        let verifier = WebPkiClientVerifier::builder(Arc::clone(&anchors))
            .build()
            .map_err(|e| TunnelError::config(format!("client verifier: {}", e)))?;
        let server = ServerConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certs.clone(), identity.key.clone_key())
            .map_err(|e| TunnelError::config(format!("server identity: {}", e)))?;

        let client = ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_root_certificates(anchors)
            .with_client_auth_cert(identity.certs, identity.key)
            .map_err(|e| TunnelError::config(format!("client identity: {}", e)))?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
            handshake_timeout,
        })
    }

    /// Load identity and anchors from PEM files
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        ca_path: &Path,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let identity = Identity::load(cert_path, key_path)?;
        let anchors = load_trust_anchors(ca_path)?;
        Self::new(identity, anchors, handshake_timeout)
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.client))
    }

    /// Responder side: handshake on an accepted stream, client certificate required
    pub async fn accept<S>(&self, stream: S) -> Result<server::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.handshake_timeout, self.acceptor().accept(stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(TunnelError::Handshake(e.to_string())),
            Err(_) => Err(TunnelError::Timeout("TLS handshake")),
        }
    }

    /// Initiator side: handshake on an already-connected stream
    pub async fn handshake<S>(&self, stream: S, server_name: &str) -> Result<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TunnelError::Handshake(format!("invalid server name: {}", e)))?;
        match tokio::time::timeout(self.handshake_timeout, self.connector().connect(name, stream))
            .await
        {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(TunnelError::Handshake(e.to_string())),
            Err(_) => Err(TunnelError::Timeout("TLS handshake")),
        }
    }

    /// Initiator side: dial `remote` and complete the handshake.
    ///
    /// The raw socket is dropped on any failure.
    pub async fn dial(
        &self,
        remote: &str,
        server_name: &str,
        connect_timeout: Duration,
        tcp_nodelay: bool,
    ) -> Result<client::TlsStream<TcpStream>> {
        let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => {
                return Err(TunnelError::UpstreamUnreachable {
                    addr: remote.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TunnelError::UpstreamUnreachable {
                    addr: remote.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                })
            }
        };
        if tcp_nodelay {
            let _ = tcp.set_nodelay(true);
        }
        self.handshake(tcp, server_name).await
    }
}

/// Host part of a `host:port` string, brackets stripped for IPv6 literals
pub fn host_of(addr: &str) -> &str {
    let host = match addr.rfind(':') {
        Some(idx) if !addr[..idx].is_empty() => &addr[..idx],
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
