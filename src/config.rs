//! Configuration module
//!
//! CLI argument parsing with environment variable support. Values are read
//! once at startup and handed to the core as an immutable `TunnelConfig`.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TunnelError};
use crate::tls::host_of;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Mutual-TLS tunnel with a SOCKS5 front-end
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Mutual-TLS tunnel with a SOCKS5 front-end")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModeArgs {
    /// Plaintext in, mutual TLS out to a fixed remote
    Client(ClientArgs),
    /// Mutual TLS in, plaintext out to a fixed upstream
    Server(ServerArgs),
    /// Mutual TLS in, SOCKS5 CONNECT to a client-chosen IPv4 target
    Socks(SocksArgs),
}

#[derive(Args, Debug, Clone)]
#[command(rename_all = "snake_case")]
pub struct ClientArgs {
    /// Remote tunnel server address (host:port)
    #[arg(
        short = 'r',
        long,
        env = "MTLS_TUNNEL_REMOTE",
        default_value = "proxy.focusworks.net:1443"
    )]
    pub remote: String,

    /// TLS server name to verify; defaults to the remote host
    #[arg(long, env = "MTLS_TUNNEL_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Local listen port
    #[arg(short = 'p', long, env = "MTLS_TUNNEL_PORT", default_value_t = 2080)]
    pub port: u16,

    /// Client certificate (PEM)
    #[arg(short = 'c', long, env = "MTLS_TUNNEL_CERT_FILE", default_value = "client.pem")]
    pub cert_file: PathBuf,

    /// Client private key (PEM)
    #[arg(short = 'k', long, env = "MTLS_TUNNEL_KEY_FILE", default_value = "client.key")]
    pub key_file: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
#[command(rename_all = "snake_case")]
pub struct ServerArgs {
    /// Plaintext upstream address every tunnel is forwarded to (host:port)
    #[arg(short = 'u', long, env = "MTLS_TUNNEL_UPSTREAM")]
    pub upstream: String,

    /// Listen port
    #[arg(short = 'p', long, env = "MTLS_TUNNEL_PORT", default_value_t = 1443)]
    pub port: u16,

    /// Server certificate (PEM)
    #[arg(short = 'c', long, env = "MTLS_TUNNEL_CERT_FILE", default_value = "server.pem")]
    pub cert_file: PathBuf,

    /// Server private key (PEM)
    #[arg(short = 'k', long, env = "MTLS_TUNNEL_KEY_FILE", default_value = "server.key")]
    pub key_file: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
#[command(rename_all = "snake_case")]
pub struct SocksArgs {
    /// Listen port
    #[arg(short = 'p', long, env = "MTLS_TUNNEL_PORT", default_value_t = 1443)]
    pub port: u16,

    /// Server certificate (PEM)
    #[arg(short = 'c', long, env = "MTLS_TUNNEL_CERT_FILE", default_value = "server.pem")]
    pub cert_file: PathBuf,

    /// Server private key (PEM)
    #[arg(short = 'k', long, env = "MTLS_TUNNEL_KEY_FILE", default_value = "server.key")]
    pub key_file: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Flags shared by every mode
#[derive(Args, Debug, Clone)]
#[command(rename_all = "snake_case")]
pub struct CommonArgs {
    /// Trusted CA bundle (PEM)
    #[arg(long = "ca", env = "MTLS_TUNNEL_CA_FILE", default_value = "ca.pem")]
    pub ca_file: PathBuf,

    /// Listen host
    #[arg(long, env = "MTLS_TUNNEL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Log level: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "MTLS_TUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    // ==================== Performance Tuning ====================
    /// TCP connect timeout to the upstream or target (default: 5s)
    #[arg(long, env = "MTLS_TUNNEL_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "MTLS_TUNNEL_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Deadline for reading the SOCKS5 greeting and request (default: 10s)
    #[arg(long, env = "MTLS_TUNNEL_REQUEST_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// Relay idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "MTLS_TUNNEL_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Duration,

    /// Relay buffer size in bytes (default: 32KB)
    #[arg(long, env = "MTLS_TUNNEL_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog (default: 1024)
    #[arg(long, env = "MTLS_TUNNEL_TCP_BACKLOG", default_value_t = 1024, help_heading = "Performance")]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY (default: true)
    #[arg(long, env = "MTLS_TUNNEL_TCP_NODELAY", default_value_t = true, action = clap::ArgAction::Set, help_heading = "Performance")]
    pub tcp_nodelay: bool,

    /// Maximum concurrent sessions, 0 = unlimited
    #[arg(long, env = "MTLS_TUNNEL_MAX_CONNECTIONS", default_value_t = 0, help_heading = "Performance")]
    pub max_connections: usize,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn common(&self) -> &CommonArgs {
        match &self.mode {
            ModeArgs::Client(args) => &args.common,
            ModeArgs::Server(args) => &args.common,
            ModeArgs::Socks(args) => &args.common,
        }
    }

    /// Validate and build the runtime configuration
    pub fn into_config(self) -> Result<TunnelConfig> {
        let (mode, port, cert_file, key_file, common) = match self.mode {
            ModeArgs::Client(args) => {
                require_host_port("remote", &args.remote)?;
                let server_name = args
                    .server_name
                    .unwrap_or_else(|| host_of(&args.remote).to_string());
                (
                    Mode::Client {
                        remote: args.remote,
                        server_name,
                    },
                    args.port,
                    args.cert_file,
                    args.key_file,
                    args.common,
                )
            }
            ModeArgs::Server(args) => {
                require_host_port("upstream", &args.upstream)?;
                (
                    Mode::Server {
                        upstream: args.upstream,
                    },
                    args.port,
                    args.cert_file,
                    args.key_file,
                    args.common,
                )
            }
            ModeArgs::Socks(args) => (
                Mode::Socks,
                args.port,
                args.cert_file,
                args.key_file,
                args.common,
            ),
        };

        require_file("certificate", &cert_file)?;
        require_file("private key", &key_file)?;
        require_file("CA bundle", &common.ca_file)?;
        if common.buffer_size == 0 {
            return Err(TunnelError::config("buffer_size must be greater than 0"));
        }
        if common.idle_timeout.is_zero() {
            return Err(TunnelError::config("idle_timeout must be greater than 0"));
        }

        Ok(TunnelConfig {
            mode,
            listen: format!("{}:{}", common.host, port),
            cert_file,
            key_file,
            ca_file: common.ca_file.clone(),
            conn: ConnConfig::from_args(&common),
        })
    }
}

fn require_file(what: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(TunnelError::config(format!(
            "TLS {} file not found: {}",
            what,
            path.display()
        )));
    }
    Ok(())
}

fn require_host_port(what: &str, addr: &str) -> Result<()> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(TunnelError::config(format!(
            "{} must be host:port, got '{}'",
            what, addr
        ))),
    }
}

/// Which front-end the process runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Plain TCP in, mutual TLS to `remote`
    Client { remote: String, server_name: String },
    /// Mutual TLS in, plain TCP to `upstream`
    Server { upstream: String },
    /// Mutual TLS in, SOCKS5 front-end picks the target
    Socks,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Client { .. } => write!(f, "client"),
            Mode::Server { .. } => write!(f, "server"),
            Mode::Socks => write!(f, "socks"),
        }
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
    pub max_connections: usize,
}

impl ConnConfig {
    pub fn from_args(args: &CommonArgs) -> Self {
        Self {
            connect_timeout: args.connect_timeout,
            tls_handshake_timeout: args.tls_handshake_timeout,
            request_timeout: args.request_timeout,
            idle_timeout: args.idle_timeout,
            buffer_size: args.buffer_size,
            tcp_backlog: args.tcp_backlog,
            tcp_nodelay: args.tcp_nodelay,
            max_connections: args.max_connections,
        }
    }
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

/// Runtime configuration, fixed at process start
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub mode: Mode,
    pub listen: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub conn: ConnConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_client_defaults() {
        let cli = CliArgs::try_parse_from(["mtls-tunnel", "client"]).unwrap();
        match &cli.mode {
            ModeArgs::Client(args) => {
                assert_eq!(args.remote, "proxy.focusworks.net:1443");
                assert_eq!(args.port, 2080);
                assert_eq!(args.cert_file, PathBuf::from("client.pem"));
                assert_eq!(args.key_file, PathBuf::from("client.key"));
                assert_eq!(args.common.ca_file, PathBuf::from("ca.pem"));
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert_eq!(cli.common().idle_timeout, Duration::from_secs(300));
        assert!(cli.common().tcp_nodelay);
    }

    #[test]
    fn test_socks_defaults() {
        let cli = CliArgs::try_parse_from(["mtls-tunnel", "socks"]).unwrap();
        match &cli.mode {
            ModeArgs::Socks(args) => {
                assert_eq!(args.port, 1443);
                assert_eq!(args.cert_file, PathBuf::from("server.pem"));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_server_requires_upstream() {
        assert!(CliArgs::try_parse_from(["mtls-tunnel", "server"]).is_err());
    }

    #[test]
    fn test_into_config_client() {
        let cli = CliArgs::try_parse_from([
            "mtls-tunnel",
            "client",
            "-r",
            "localhost:1443",
            "-p",
            "3080",
            "-c",
            &fixture("client.pem"),
            "-k",
            &fixture("client.key"),
            "--ca",
            &fixture("ca.pem"),
            "--connect_timeout",
            "2s",
        ])
        .unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(
            config.mode,
            Mode::Client {
                remote: "localhost:1443".to_string(),
                server_name: "localhost".to_string(),
            }
        );
        assert_eq!(config.listen, "0.0.0.0:3080");
        assert_eq!(config.conn.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_into_config_missing_ca() {
        let cli = CliArgs::try_parse_from([
            "mtls-tunnel",
            "socks",
            "-c",
            &fixture("server.pem"),
            "-k",
            &fixture("server.key"),
            "--ca",
            "/nonexistent/ca.pem",
        ])
        .unwrap();
        let err = cli.into_config().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("CA bundle"));
    }

    #[test]
    fn test_into_config_bad_upstream() {
        let cli = CliArgs::try_parse_from([
            "mtls-tunnel",
            "server",
            "--upstream",
            "no-port",
            "-c",
            &fixture("server.pem"),
            "-k",
            &fixture("server.key"),
            "--ca",
            &fixture("ca.pem"),
        ])
        .unwrap();
        assert!(cli.into_config().unwrap_err().is_fatal());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::Socks.to_string(), "socks");
        assert_eq!(
            Mode::Server {
                upstream: "127.0.0.1:80".into()
            }
            .to_string(),
            "server"
        );
    }
}
