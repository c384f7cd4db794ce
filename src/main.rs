//! serverbench supervisor
//!
//! Host-resident agent managing isolated workload containers on behalf of
//! the serverbench control plane. It dials out over a persistent
//! WebSocket, reports hardware inventory, reconciles the local Docker
//! state against the control plane's desired container set, and executes
//! lifecycle, power, password and deploy operations with per-container
//! network and user isolation.

use anyhow::{Context, Result};
use bollard::Docker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod action;
mod client;
mod command;
mod config;
mod container;
mod errors;
mod firewall;
mod git;
mod hardware;
mod machine;
mod pipe;
mod proto;
mod user;

/// Pause between reconnect attempts.
const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "serverbench_supervisor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("serverbench supervisor starting");

    let docker = Docker::connect_with_local_defaults().context("connecting to docker")?;

    loop {
        match client::Client::run(docker.clone()).await {
            Ok(()) => unreachable!("the engine only returns on error"),
            Err(e)
                if matches!(
                    e.downcast_ref::<errors::SupervisorError>(),
                    Some(errors::SupervisorError::ConnectionClosed)
                ) =>
            {
                tracing::error!("connection ended: {e:#}");
            }
            // Startup conditions (missing key, non-root, no public
            // interface, unknown self mount) are not retryable.
            Err(e) => return Err(e),
        }
        tracing::info!("reconnecting in {}s", RECONNECT_BACKOFF.as_secs());
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}
