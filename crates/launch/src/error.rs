//! Launch error types.

use std::path::PathBuf;
use std::time::Duration;

use concurrent::{ErrorCause, QueryError, codes};
use services::{RegistryError, SessionError};
use thiserror::Error;

use crate::version::BackendVersion;

/// Errors that can occur while launching a debug session.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The launch was cancelled; any partial session has been cleaned up.
    #[error("Launch was cancelled")]
    Cancelled,

    /// The launch configuration is incomplete or inconsistent.
    #[error("Invalid launch configuration: {0}")]
    InvalidConfiguration(String),

    /// A non-attach launch did not name a program.
    #[error("Program not specified")]
    ProgramNotSpecified,

    /// The program to debug does not exist.
    #[error("Program file does not exist: {}", .0.display())]
    ProgramNotFound(PathBuf),

    /// The backend version string could not be parsed.
    #[error("Invalid backend version: {0:?}")]
    InvalidVersion(String),

    /// Non-stop mode needs a newer backend.
    #[error("Non-stop mode is not supported for backend {version}, {required} or higher is required")]
    NonStopNotSupported {
        version: BackendVersion,
        required: BackendVersion,
    },

    /// Post-mortem tracing needs a newer backend.
    #[error(
        "Post-mortem tracing is not supported for backend {version}, {required} or higher is required"
    )]
    PostMortemTracingNotSupported {
        version: BackendVersion,
        required: BackendVersion,
    },

    /// The backend process could not be started.
    #[error("Failed to start backend: {0}")]
    Spawn(String),

    /// The backend rejected a request or is no longer reachable.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A service needed by the launch is not registered for the session.
    #[error("Service not available: {0}")]
    ServiceUnavailable(&'static str),

    /// The services launch sequence failed.
    #[error("Error in services launch sequence: {0}")]
    ServicesSequence(ErrorCause),

    /// Completing the backend initialization failed.
    #[error("Error in final launch sequence: {0}")]
    CompleteInitialization(ErrorCause),

    /// The launching thread was interrupted while waiting on the session.
    #[error("Interrupted while waiting on the dispatch executor")]
    Interrupted,

    /// A launch phase did not finish in time.
    #[error("Launch phase '{phase}' timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    /// Query misuse, such as waiting from inside the session executor.
    #[error("Query error: {0}")]
    Query(QueryError),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Registry error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LaunchError {
    /// Returns the status code used when the error travels through a monitor.
    pub fn code(&self) -> i32 {
        match self {
            LaunchError::Cancelled => codes::CANCELLED,
            LaunchError::NonStopNotSupported { .. }
            | LaunchError::PostMortemTracingNotSupported { .. } => codes::NOT_SUPPORTED,
            LaunchError::ServiceUnavailable(_)
            | LaunchError::Session(_)
            | LaunchError::Registry(_) => codes::INVALID_STATE,
            LaunchError::Interrupted | LaunchError::Query(_) => codes::INTERNAL_ERROR,
            LaunchError::ServicesSequence(cause) | LaunchError::CompleteInitialization(cause) => {
                cause.code
            }
            _ => codes::REQUEST_FAILED,
        }
    }
}

impl From<LaunchError> for ErrorCause {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::ServicesSequence(cause) | LaunchError::CompleteInitialization(cause) => {
                cause
            }
            other => ErrorCause::new(other.code(), other.to_string()),
        }
    }
}

/// Convenience type alias for launch results.
pub type Result<T> = std::result::Result<T, LaunchError>;
