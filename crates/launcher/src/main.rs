//! Launcher entry point.

use std::process::ExitCode;
use std::sync::Arc;

use launch::{CliConfigurator, LaunchDelegate, TokioProcessSpawner};
use launcher::{Config, SessionLogger};
use tokio::runtime::Handle;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, shutting down the session");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, shutting down the session");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(%err, "metrics recorder not installed");
            None
        }
    };

    // 3. Create the delegate with the process-backed collaborators
    let delegate = LaunchDelegate::new(
        Handle::current(),
        Arc::new(TokioProcessSpawner),
        Arc::new(CliConfigurator),
    )
    .with_timeout(config.launch_timeout);
    delegate
        .sessions()
        .add_ended_listener(Arc::new(SessionLogger));

    // 4. Launch and wait for the backend
    let outcome = launcher::run(&config, Arc::new(delegate), shutdown_signal()).await;

    if let Some(handle) = metrics_handle {
        tracing::debug!(metrics = %handle.render(), "launch metrics");
    }

    match outcome {
        Ok(Some(0) | None) => ExitCode::SUCCESS,
        Ok(Some(code)) => {
            tracing::warn!(code, "backend exited with a failure code");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(%err, code = err.code(), "launch failed");
            ExitCode::FAILURE
        }
    }
}
