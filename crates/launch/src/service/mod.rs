//! Services created for a launch session.

pub mod control;
pub mod run_control;

pub use control::{CommandControl, ControlState};
pub use run_control::RunControl;
