//! polypd - VLAN/bridge network driver daemon
//!
//! Entry point for the polypd daemon.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use polypd::{server, Args, DaemonConfig, Driver, IpLinks, NetworkRegistry, Provisioner};

/// Installs the fmt subscriber; `RUST_LOG` wins over the configured level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        socket = %config.plugin.socket.display(),
        scope = %config.plugin.scope,
        iface = %config.network.iface,
        store = %config.store.url,
        namespace = %config.store.namespace,
        "--- Starting polypd ---"
    );

    let store = polyp_store::connect(&config.store.url)
        .await
        .with_context(|| format!("connecting to store {}", config.store.url))?;

    let provisioner = Arc::new(Provisioner::new(
        Arc::new(IpLinks::new()),
        config.network.iface.clone(),
    ));
    if !provisioner
        .parent_exists()
        .await
        .context("checking parent interface")?
    {
        bail!("parent interface {} does not exist", config.network.iface);
    }

    let networks = NetworkRegistry::new(store, provisioner, config.store.namespace.clone());
    let driver = Arc::new(Driver::new(
        config.plugin.scope,
        config.network.default_mtu,
        networks,
    ));

    server::serve(&config.plugin.socket, driver.clone(), shutdown_signal())
        .await
        .with_context(|| format!("serving on {}", config.plugin.socket.display()))?;

    driver.shutdown().await;
    info!("polypd stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::from_args(&args).context("loading configuration")?;
    init_logging(&config.log_level);

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "polypd failed");
        return Err(e);
    }
    Ok(())
}
