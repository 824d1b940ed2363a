//! Asynchronous coordination primitives for bringing up a launch session.
//!
//! The crate provides:
//! - [`RequestMonitor`]: a completion token for one asynchronous operation,
//!   with advisory, tree-shaped cancellation
//! - [`DispatchExecutor`]: a per-session serialization point; tasks of one
//!   executor never overlap and run in submission order
//! - [`Query`]: lets a thread outside the executor block until an operation
//!   running inside it completes
//! - [`Sequence`] of [`Step`]s: runs steps in order and rolls back completed
//!   steps in reverse order when a later step fails or is canceled

pub mod error;
pub mod executor;
pub mod monitor;
pub mod query;
pub mod sequence;
pub mod state;
pub mod status;
pub mod step;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{ExecutorError, MonitorError, QueryError, QueryResult, SecondaryRollbackFault};
pub use executor::{DispatchExecutor, ScheduledTask};
pub use monitor::{MonitorStatus, RequestMonitor};
pub use query::{Query, QueryInterrupter};
pub use sequence::{Sequence, SequenceObserver, SequenceReport};
pub use state::SequenceState;
pub use status::{ErrorCause, codes};
pub use step::{FnStep, Step};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
