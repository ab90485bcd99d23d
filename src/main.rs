use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mtls_tunnel::config::CliArgs;
use mtls_tunnel::handler::Tunnel;
use mtls_tunnel::logger::{self, log};
use mtls_tunnel::server_runner;
use mtls_tunnel::tls::TrustConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Must happen before any TLS config is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = CliArgs::parse_args();
    logger::init_logger(&cli.common().log_level);

    let config = cli.into_config()?;
    let trust = TrustConfig::from_files(
        &config.cert_file,
        &config.key_file,
        &config.ca_file,
        config.conn.tls_handshake_timeout,
    )?;
    log::info!(
        mode = %config.mode,
        cert = %config.cert_file.display(),
        ca = %config.ca_file.display(),
        "Trust material loaded"
    );

    let tunnel = Arc::new(Tunnel::new(config.mode.clone(), trust, config.conn));

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                    _ => {
                        log::warn!("Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        shutdown_signal.cancel();
    });

    server_runner::run_server(tunnel, &config, shutdown).await
}
