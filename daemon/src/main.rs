use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ryuk::config::Config;
use ryuk::Reaper;
use ryuk_core::runtime::docker::DockerRuntime;
use ryuk_core::runtime::RuntimeClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.verbose);
    info!("ryuk {} starting", VERSION);

    let shutdown = setup_shutdown_signal();

    let runtime = DockerRuntime::connect()
        .await
        .context("failed to connect to the container runtime")?;
    runtime
        .ping()
        .await
        .context("container runtime did not answer ping")?;

    let reaper = Reaper::bind(config, Arc::new(runtime), shutdown).await?;
    let report = reaper.run().await?;

    if !report.errors.is_empty() {
        error!(errors = report.errors.len(), "cleanup finished with leftovers");
    }
    info!("done");
    Ok(())
}

/// Initialize the tracing subscriber with stderr output.
///
/// `RUST_LOG` wins when set; otherwise the verbose flag picks debug or
/// info as the default level.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT (Ctrl+C) and triggers the returned
/// `CancellationToken` when either is received.
fn setup_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C), initiating shutdown");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, initiating shutdown");
        }

        token_clone.cancel();
    });

    token
}
