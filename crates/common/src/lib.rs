//! Shared identifiers used across the session launch crates.

pub mod types;

pub use types::{RunId, SessionId, SessionIdGenerator};
