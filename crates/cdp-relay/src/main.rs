mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use ws_relay::{HttpSessionVerifier, Proxy, ProxyConfig, UpstreamResolver};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args (flags and their environment variables).
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;
    cfg.merge_cli(&cli);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if !cli.config.exists() {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    cfg.validate().context("invalid configuration")?;

    // 4. TLS provider for upstream wss:// dials and the HTTPS clients.
    install_crypto_provider();

    let listen_addr = cfg.listen_addr()?;
    let resolver_config = cfg.resolver_config()?;

    info!(
        config_file = %cli.config.display(),
        listen = %listen_addr,
        upstream_mode = ?resolver_config.mode,
        verify_enabled = cfg.verify.enabled,
        buffer_capacity = cfg.relay.buffer_capacity,
        keepalive_secs = cfg.relay.keepalive_secs,
        "cdp-relay starting"
    );

    for warning in cfg.warnings() {
        warn!("{warning}");
    }

    // 5. Build the verifier and the upstream resolver.
    let verifier = HttpSessionVerifier::new(cfg.verifier_config()?)
        .context("failed to build verification HTTP client")?;
    let resolver = UpstreamResolver::new(resolver_config)
        .context("failed to build discovery HTTP client")?;

    // 6. Create the relay.
    let proxy_config = ProxyConfig {
        listen_addr,
        verify_enabled: cfg.verify.enabled,
        session: cfg.session_config(),
        upstream_connect_timeout: cfg.connect_timeout(),
    };
    let proxy = Proxy::new(proxy_config, Arc::new(verifier), resolver);

    // 7. Run until the listener fails or a shutdown signal arrives.
    let result = tokio::select! {
        r = proxy.run() => r.context("relay listener failed"),
        _ = shutdown_signal() => Ok(()),
    };

    info!("cdp-relay shutting down");
    result
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("received SIGINT (ctrl-c)");
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {
                        info!("received SIGTERM");
                    }
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
}
