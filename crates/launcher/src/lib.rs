//! Runs one debug session from a launch configuration file until the
//! backend exits or a shutdown is requested.

pub mod config;

use std::future::Future;
use std::sync::Arc;

use launch::{LaunchCancellation, LaunchConfiguration, LaunchDelegate, LaunchError};
use services::{Session, SessionEndedListener};

pub use config::Config;

/// Logs every session that ends.
#[derive(Debug, Default)]
pub struct SessionLogger;

impl SessionEndedListener for SessionLogger {
    fn session_ended(&self, session: &Session) {
        tracing::info!(session = %session.id(), "debug session ended");
    }
}

/// Launches the configured program and waits for the backend to exit.
///
/// Returns the backend's exit code, or `None` when `shutdown` completed
/// first and the session was torn down.
pub async fn run(
    config: &Config,
    delegate: Arc<LaunchDelegate>,
    shutdown: impl Future<Output = ()>,
) -> Result<Option<i32>, LaunchError> {
    let launch_config = LaunchConfiguration::load(&config.launch_config)?;
    tracing::info!(
        path = %config.launch_config.display(),
        session_type = %launch_config.session_type,
        "loaded launch configuration"
    );

    let cancellation = LaunchCancellation::new();
    let task = {
        let cancellation = cancellation.clone();
        tokio::task::spawn_blocking(move || delegate.launch(launch_config, &cancellation))
    };
    tokio::pin!(task);
    tokio::pin!(shutdown);

    let launch = tokio::select! {
        joined = &mut task => joined.map_err(|err| LaunchError::Io(std::io::Error::other(err)))??,
        () = &mut shutdown => {
            tracing::info!("shutdown requested while launching");
            cancellation.cancel();
            // The launch may have completed before it saw the cancellation.
            if let Ok(Ok(launch)) = task.await {
                launch.shutdown();
            }
            return Err(LaunchError::Cancelled);
        }
    };

    tracing::info!(
        session = %launch.session_id(),
        flavor = %launch.flavor(),
        pid = ?launch.control().and_then(|control| control.pid()),
        "backend running"
    );

    let exit_code = tokio::select! {
        code = launch.wait_for_exit() => {
            tracing::info!(?code, "backend exited");
            code
        }
        () = &mut shutdown => None,
    };

    launch.shutdown();
    Ok(exit_code)
}
