//! Chooses the service implementations that match the backend.

use std::sync::Arc;

use common::SessionId;
use serde::{Deserialize, Serialize};

use crate::service::{CommandControl, RunControl};
use crate::version::{BackendVersion, RUN_CONTROL_7_2_VERSION, known};

/// Run-control implementation used for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunControlFlavor {
    /// Every thread stops when one thread stops.
    AllStop,
    /// Non-stop run control for backends before 7.2.
    NonStop70,
    /// Non-stop run control for backends 7.2 and later.
    NonStop72,
}

impl RunControlFlavor {
    /// Returns true for the non-stop flavors.
    pub fn is_non_stop(&self) -> bool {
        !matches!(self, RunControlFlavor::AllStop)
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunControlFlavor::AllStop => "all-stop",
            RunControlFlavor::NonStop70 => "non-stop-7.0",
            RunControlFlavor::NonStop72 => "non-stop-7.2",
        }
    }
}

impl std::fmt::Display for RunControlFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Creates the services of one session.
#[derive(Debug, Clone)]
pub struct ServicesFactory {
    version: BackendVersion,
    non_stop: bool,
}

impl ServicesFactory {
    /// Creates a factory for `version`.
    ///
    /// Non-stop services are only produced when the backend supports them;
    /// otherwise the factory falls back to all-stop.
    pub fn new(version: BackendVersion, non_stop: bool) -> Self {
        let non_stop = non_stop && version.supports_non_stop();
        Self { version, non_stop }
    }

    /// Returns the backend version the factory targets.
    pub fn version(&self) -> &BackendVersion {
        &self.version
    }

    /// Returns the run-control flavor for the backend.
    pub fn run_control_flavor(&self) -> RunControlFlavor {
        if !self.non_stop {
            RunControlFlavor::AllStop
        } else if self.version.at_least(&known(RUN_CONTROL_7_2_VERSION)) {
            RunControlFlavor::NonStop72
        } else {
            RunControlFlavor::NonStop70
        }
    }

    /// Creates the command control service.
    pub fn create_command_control(&self, session: SessionId) -> Arc<CommandControl> {
        Arc::new(CommandControl::new(session, self.version.clone()))
    }

    /// Creates the run control service.
    pub fn create_run_control(&self, session: SessionId) -> Arc<RunControl> {
        Arc::new(RunControl::new(session, self.run_control_flavor()))
    }
}
