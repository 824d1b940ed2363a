//! Run control service.

use common::SessionId;

use crate::factory::RunControlFlavor;

/// Execution control of the debugged program, in the flavor chosen by the
/// services factory.
#[derive(Debug)]
pub struct RunControl {
    session: SessionId,
    flavor: RunControlFlavor,
}

impl RunControl {
    /// Creates the service for `session`.
    pub fn new(session: SessionId, flavor: RunControlFlavor) -> Self {
        Self { session, flavor }
    }

    /// Returns the owning session.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns the flavor.
    pub fn flavor(&self) -> RunControlFlavor {
        self.flavor
    }

    /// Returns the backend command selecting this flavor's mode, if any.
    pub fn mode_command(&self) -> Option<&'static str> {
        self.flavor.is_non_stop().then_some("set non-stop on")
    }
}
