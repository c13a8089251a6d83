//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::coordinator::RequestCoordinator;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    /// How long to wait for live hosts to be destroyed on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(120),
        }
    }
}

/// Serve `GET /hosts` until SIGINT/SIGTERM, then tear down every live host.
pub async fn serve(config: ServerConfig, coordinator: Arc<RequestCoordinator>) -> anyhow::Result<()> {
    let app = routes(Arc::clone(&coordinator), config.heartbeat_interval);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(
        capacity = coordinator.gate().capacity(),
        "Starting hostpool server on {}", actual_addr
    );

    let signalled = Arc::clone(&coordinator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Fail queued requests and cancel live hosts so in-flight
            // responses finish and the connections can drain.
            signalled.trigger_shutdown();
        })
        .await?;

    info!("Server shutdown complete");

    if !coordinator.shutdown(config.shutdown_grace).await {
        tracing::warn!(
            grace = ?config.shutdown_grace,
            "Some hosts were not destroyed before the shutdown deadline"
        );
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That should fail fast at startup.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
