//! Live services scoped to a launch session.
//!
//! A [`Session`] couples one [`DispatchExecutor`](concurrent::DispatchExecutor)
//! with the services created for it. Services are stored in a
//! [`ServiceRegistry`] keyed by session id and capability type, and are
//! released together when the session ends.

pub mod error;
pub mod registry;
pub mod session;

pub use error::{RegistryError, Result, SessionError};
pub use registry::ServiceRegistry;
pub use session::{Session, SessionEndedListener, SessionManager};
