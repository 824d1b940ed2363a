//! Sequence state machine.

use serde::{Deserialize, Serialize};

/// The state of a sequence in its lifecycle.
///
/// State transitions:
/// ```text
/// NotStarted ──► Running(0) ──► … ──► Running(n-1) ──┬──► Succeeded
///                    │                               │
///                    └──────────────┬────────────────┘ (error or cancel)
///                                   ▼
///                        RollingBack(i-1) ──► … ──► RollingBack(0) ──┬──► Failed
///                                                                   └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SequenceState {
    /// The sequence has not been submitted yet.
    #[default]
    NotStarted,

    /// The forward action of the step at this index is in flight.
    Running(usize),

    /// The rollback action of the step at this index is in flight.
    RollingBack(usize),

    /// Every step completed successfully (terminal state).
    Succeeded,

    /// A step failed and rollback finished (terminal state).
    Failed,

    /// Cancellation was observed and rollback finished (terminal state).
    Cancelled,
}

impl SequenceState {
    /// Returns true if the sequence can begin running.
    pub fn can_run(&self) -> bool {
        matches!(self, SequenceState::NotStarted)
    }

    /// Returns true while completed steps are being rolled back.
    pub fn is_rolling_back(&self) -> bool {
        matches!(self, SequenceState::RollingBack(_))
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Succeeded | SequenceState::Failed | SequenceState::Cancelled
        )
    }

    /// Returns the index of the step currently executing or rolling back.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            SequenceState::Running(index) | SequenceState::RollingBack(index) => Some(*index),
            _ => None,
        }
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceState::NotStarted => "NotStarted",
            SequenceState::Running(_) => "Running",
            SequenceState::RollingBack(_) => "RollingBack",
            SequenceState::Succeeded => "Succeeded",
            SequenceState::Failed => "Failed",
            SequenceState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step_index() {
            Some(index) => write!(f, "{}({})", self.as_str(), index),
            None => write!(f, "{}", self.as_str()),
        }
    }
}
