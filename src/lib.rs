//! Mutual-TLS TCP tunnel with a SOCKS5 front-end
//!
//! Layout:
//! - `tls`: trust handshake (identity, trust anchors, both roles)
//! - `socks5`: SOCKS5 method selection and CONNECT front-end
//! - `relay`: bidirectional relay with joined directions and idle timeout
//! - `handler`: per-connection pipelines composing the three
//! - `server_runner`: listener bring-up and accept loop

pub mod config;
pub mod error;
pub mod handler;
pub mod logger;
pub mod relay;
pub mod server_runner;
pub mod socks5;
pub mod tls;

pub use error::{Result, TunnelError};
