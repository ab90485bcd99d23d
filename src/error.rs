use std::io;
use thiserror::Error;

use crate::socks5::Rep;

/// Unified error type for tunnel sessions and startup
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Identity or trust material unusable; aborts startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unsupported SOCKS header
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// SOCKS command other than CONNECT
    #[error("Command not supported: {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS address type other than IPv4
    #[error("Address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Dial to destination or tunnel peer failed
    #[error("Upstream unreachable: {addr}: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with the peer failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// A deadline expired before the step completed
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Read/write failure on either stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TunnelError::ProtocolMismatch(msg.into())
    }

    /// Only configuration errors stop the process; everything else is confined to one session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Config(_))
    }

    /// SOCKS reply code a front-end client sees for this failure, if any
    pub fn reply_code(&self) -> Option<Rep> {
        match self {
            TunnelError::ProtocolMismatch(_) | TunnelError::UnsupportedCommand(_) => {
                Some(Rep::GeneralFailure)
            }
            TunnelError::UnsupportedAddressType(_) => Some(Rep::AddressTypeNotSupported),
            TunnelError::UpstreamUnreachable { .. } => Some(Rep::ConnectionRefused),
            _ => None,
        }
    }
}
