//! Framework error types.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::monitor::MonitorStatus;
use crate::status::ErrorCause;

/// Misuse of a [`RequestMonitor`](crate::RequestMonitor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// The monitor was completed a second time.
    #[error("Request monitor already completed with status {status}")]
    DoubleCompletion { status: MonitorStatus },

    /// A completion callback was installed after the previous one already ran.
    #[error("Completion callback already fired")]
    CallbackAlreadyFired,
}

/// Errors raised by a [`DispatchExecutor`](crate::DispatchExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The executor no longer accepts tasks.
    #[error("Dispatch executor '{name}' is shut down")]
    ShutDown { name: String },

    /// No tokio runtime is available to host the executor.
    #[error("No tokio runtime available to host a dispatch executor")]
    NoRuntime,
}

/// Outcomes of [`Query::run`](crate::Query::run) other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The caller runs inside the dispatch executor the query targets.
    #[error("Query would deadlock: called from inside dispatch executor '{executor}'")]
    Deadlock { executor: String },

    /// The query did not complete in time.
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// The blocked caller was interrupted.
    #[error("Query was interrupted")]
    Interrupted,

    /// The wrapped operation stopped because it was canceled.
    #[error("Query was cancelled: {0}")]
    Cancelled(ErrorCause),

    /// The wrapped operation failed.
    #[error("Query failed: {0}")]
    Failed(ErrorCause),

    /// The operation could not be handed to the executor.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl QueryError {
    /// Converts the error into a structured cause.
    pub fn into_cause(self) -> ErrorCause {
        match self {
            QueryError::Cancelled(cause) | QueryError::Failed(cause) => cause,
            other => ErrorCause::internal(other.to_string()),
        }
    }
}

/// A rollback action that itself failed.
///
/// These faults are logged and recorded in the
/// [`SequenceReport`](crate::SequenceReport); they never replace the cause
/// that triggered the rollback.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Rollback of step '{step}' (#{index}) failed: {cause}")]
pub struct SecondaryRollbackFault {
    pub index: usize,
    pub step: String,
    pub cause: ErrorCause,
}

/// Convenience type alias for query results.
pub type QueryResult<T> = std::result::Result<T, QueryError>;
