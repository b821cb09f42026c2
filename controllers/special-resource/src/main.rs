//! Special Resource Operator
//!
//! Watches cluster-scoped `SpecialResource` objects, renders the referenced
//! chart against the kernel/OS fingerprint of the cluster's worker nodes and
//! rolls the resulting manifests out state by state, waiting for each state
//! to become ready before the next one starts.

mod backoff;
mod config;
mod controller;
mod error;
mod events;
mod leader;
mod metrics;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use clap::Parser;
use config::OperatorConfig;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    install_crypto_provider();

    let config = OperatorConfig::parse();
    config.validate()?;

    info!("Starting Special Resource Operator");
    info!("Configuration:");
    info!("  Operator namespace: {}", config.operator_namespace);
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Leader election: {}", config.enable_leader_election);
    info!("  Concurrency: {}", config.concurrency);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let controller = Controller::new(config, shutdown).await?;
    controller.run().await?;

    Ok(())
}

/// Selects ring as the process-wide rustls provider; kube and reqwest both use rustls.
///
/// Returns `false` when a provider was already installed.
fn install_crypto_provider() -> bool {
    match rustls::crypto::ring::default_provider().install_default() {
        Ok(()) => true,
        Err(_) => {
            debug!("rustls crypto provider already installed");
            false
        }
    }
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_provider_install_is_idempotent() {
        install_crypto_provider();
        assert!(!install_crypto_provider());
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }
}
