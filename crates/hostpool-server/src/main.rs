//! hostpool server binary.
//!
//! Loads configuration from the environment, destroys hosts left over from a
//! previous run, then serves `GET /hosts` until SIGINT/SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hostpool::{
    AdmissionGate, ConfigError, DigitalOceanClient, PoolConfig, ProvisioningBackend,
    RequestCoordinator, ServerConfig, StartupReconciler,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Delay before exiting after a failed reconciliation, so a supervisor
/// restarting the process does not hammer the backend API.
const RECONCILE_FAILURE_DELAY: Duration = Duration::from_secs(20);

/// Filter directives: `RUST_LOG` verbatim, otherwise the `HOSTPOOL_LOG`
/// level applied to this binary and the library.
fn filter_directives(rust_log: Option<&str>, level: Option<&str>) -> String {
    if let Some(directives) = rust_log {
        return directives.to_string();
    }
    let level = match level.map(str::to_ascii_lowercase).as_deref() {
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("hostpool={level},hostpool_server={level}")
}

/// Log to stderr; `LOG_FORMAT=json` selects one JSON object per line.
fn init_tracing() {
    let directives = filter_directives(
        std::env::var("RUST_LOG").ok().as_deref(),
        std::env::var("HOSTPOOL_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("invalid log filter {directives:?}: {e}");
        EnvFilter::new(filter_directives(None, None))
    });

    let (json, text) = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    info!("hostpool {}", env!("CARGO_PKG_VERSION"));

    let config = match PoolConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(keys)) => {
            eprintln!("All configuration is required. Missing:");
            for key in keys {
                eprintln!("  {key}");
            }
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "hostpool exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: PoolConfig) -> anyhow::Result<()> {
    let backend: Arc<dyn ProvisioningBackend> = Arc::new(
        DigitalOceanClient::new(config.backend.clone()).context("building backend client")?,
    );

    let reconciler = StartupReconciler::new(Arc::clone(&backend), config.prefix());
    if let Err(e) = reconciler.run().await {
        error!(
            error = %e,
            prefix = %reconciler.prefix(),
            "Startup reconciliation failed, exiting in {:?}", RECONCILE_FAILURE_DELAY
        );
        tokio::time::sleep(RECONCILE_FAILURE_DELAY).await;
        return Err(e).context("startup reconciliation");
    }

    let gate = AdmissionGate::new(config.capacity).context("building admission gate")?;
    let coordinator = Arc::new(RequestCoordinator::new(
        gate,
        backend,
        config.coordinator_config(),
    ));
    info!(
        pool = %config.name,
        capacity = config.capacity,
        timeout = ?config.timeout,
        "Server ready"
    );

    let server = ServerConfig {
        host: config.host.clone(),
        port: config.port,
        heartbeat_interval: config.heartbeat_interval,
        ..ServerConfig::default()
    };
    hostpool::serve(server, coordinator).await
}
