//! Launching a debug backend for a session.
//!
//! A launch validates its [`LaunchConfiguration`], starts a [`Session`],
//! runs the services launch sequence on the session's dispatch executor and
//! then completes the backend's initialization:
//! 1. Create the control and run-control services
//! 2. Start the backend process
//! 3. Load, attach or connect to the program
//! 4. Configure the backend
//!
//! If any step fails, the steps already done are rolled back in reverse order
//! and the session is ended.
//!
//! [`Session`]: services::Session

pub mod config;
pub mod configurator;
pub mod delegate;
pub mod error;
pub mod factory;
pub mod process;
pub mod sequence;
pub mod service;
pub mod version;

pub use config::{LaunchConfiguration, SessionType};
pub use configurator::{BackendConfigurator, CliConfigurator, InMemoryConfigurator};
pub use delegate::{Launch, LaunchCancellation, LaunchDelegate};
pub use error::{LaunchError, Result};
pub use factory::{RunControlFlavor, ServicesFactory};
pub use process::{
    BackendCommand, InMemoryProcessSpawner, ProcessHandle, ProcessSpawner, SpawnedProcess,
    TokioProcessSpawner,
};
pub use service::{CommandControl, ControlState, RunControl};
pub use version::BackendVersion;
