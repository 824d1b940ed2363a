//! Structured failure causes carried by request monitors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known error codes.
///
/// Codes outside this list are free for callers to use for their own
/// failures; the framework only interprets [`codes::CANCELLED`].
pub mod codes {
    /// The operation observed a cancellation request and stopped.
    pub const CANCELLED: i32 = 8;
    /// The requested operation is not supported by the target.
    pub const NOT_SUPPORTED: i32 = 10002;
    /// The target is not in a state that allows the operation.
    pub const INVALID_STATE: i32 = 10003;
    /// The request was rejected or failed on the target side.
    pub const REQUEST_FAILED: i32 = 10005;
    /// A fault inside the framework or its glue code.
    pub const INTERNAL_ERROR: i32 = 10006;
}

/// Why an asynchronous operation failed.
///
/// A cause has a numeric code, a human readable message and an optional
/// nested cause, forming a chain from the outermost description down to the
/// original fault.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct ErrorCause {
    pub code: i32,
    pub message: String,
    #[source]
    pub cause: Option<Box<ErrorCause>>,
}

impl ErrorCause {
    /// Creates a cause without a nested cause.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// The cause reported by operations that stopped because they were canceled.
    pub fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "Request cancelled")
    }

    /// Shorthand for an [`codes::INTERNAL_ERROR`] cause.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Shorthand for a [`codes::REQUEST_FAILED`] cause.
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::new(codes::REQUEST_FAILED, message)
    }

    /// Attaches `cause` as the nested cause of `self`.
    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns true if this cause reports a cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.code == codes::CANCELLED
    }

    /// Iterates over this cause and every nested cause, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorCause> {
        std::iter::successors(Some(self), |cause| cause.cause.as_deref())
    }

    /// Returns the innermost cause of the chain.
    pub fn root_cause(&self) -> &ErrorCause {
        self.chain().last().unwrap_or(self)
    }
}
