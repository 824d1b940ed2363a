//! Registry and session error types.

use common::SessionId;
use concurrent::{ErrorCause, ExecutorError, codes};
use thiserror::Error;

/// Errors raised by the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A service of this capability is already registered for the session.
    #[error("Capability {capability} is already registered for {session}")]
    DuplicateCapability {
        session: SessionId,
        capability: &'static str,
    },
}

impl From<RegistryError> for ErrorCause {
    fn from(err: RegistryError) -> Self {
        ErrorCause::new(codes::INVALID_STATE, err.to_string())
    }
}

/// Errors that can occur while managing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// A live session already uses this id.
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),

    /// No live session has this id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The session has ended and accepts no more services.
    #[error("Session has ended: {0}")]
    Ended(SessionId),

    /// Registry error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Executor error.
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Convenience type alias for session results.
pub type Result<T> = std::result::Result<T, SessionError>;
