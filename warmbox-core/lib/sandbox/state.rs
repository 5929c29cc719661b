//! The sandbox lifecycle state machine.
//!
//! ```text
//! Created --start/fork--> Running <--pause/unpause--> Paused
//!    \                       |                          /
//!     `--------------------> Destroyed <---------------'
//! ```
//!
//! A running zygote can fork children without leaving `Running`. `Destroyed` is terminal and
//! destroying again is allowed (and does nothing).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{sandbox::SandboxId, WarmboxError, WarmboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a sandbox is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Resources are allocated but no process runs yet.
    Created,

    /// A process runs in the sandbox.
    Running,

    /// The sandbox's processes are frozen.
    Paused,

    /// The sandbox is gone. Terminal.
    Destroyed,
}

/// An operation that changes a sandbox's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxOp {
    /// Start a fresh process, or receive one forked from a parent.
    Start,

    /// Fork a child from this sandbox.
    Fork,

    /// Freeze the sandbox.
    Pause,

    /// Resume the sandbox.
    Unpause,

    /// Tear the sandbox down.
    Destroy,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxState {
    /// The state reached by applying `op`, or `None` if `op` is not allowed here.
    pub fn transition(self, op: SandboxOp) -> Option<SandboxState> {
        use SandboxOp::*;
        use SandboxState::*;

        match (self, op) {
            (_, Destroy) => Some(Destroyed),
            (Created, Start) => Some(Running),
            (Running, Fork) => Some(Running),
            (Running, Pause) => Some(Paused),
            (Paused, Unpause) => Some(Running),
            _ => None,
        }
    }

    /// Like [`transition`](Self::transition), but reports a disallowed operation as an error.
    pub fn check(self, id: SandboxId, op: SandboxOp) -> WarmboxResult<SandboxState> {
        self.transition(op)
            .ok_or(WarmboxError::InvalidStateTransition {
                id,
                op,
                state: self,
            })
    }

    /// Whether the sandbox is gone.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, SandboxState::Destroyed)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

impl fmt::Display for SandboxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Fork => write!(f, "fork"),
            Self::Pause => write!(f, "pause"),
            Self::Unpause => write!(f, "unpause"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use SandboxOp::*;
        use SandboxState::*;

        assert_eq!(Created.transition(Start), Some(Running));
        assert_eq!(Running.transition(Pause), Some(Paused));
        assert_eq!(Paused.transition(Unpause), Some(Running));
        assert_eq!(Running.transition(Fork), Some(Running));

        assert_eq!(Created.transition(Pause), None);
        assert_eq!(Paused.transition(Pause), None);
        assert_eq!(Paused.transition(Fork), None);
        assert_eq!(Running.transition(Start), None);
        assert_eq!(Running.transition(Unpause), None);

        for state in [Created, Running, Paused, Destroyed] {
            assert_eq!(state.transition(Destroy), Some(Destroyed));
        }
    }

    #[test]
    fn test_destroyed_is_terminal() {
        use SandboxOp::*;

        for op in [Start, Fork, Pause, Unpause] {
            assert_eq!(SandboxState::Destroyed.transition(op), None);
        }
    }

    #[test]
    fn test_check_reports_state() {
        let err = SandboxState::Paused
            .check(SandboxId::new(3), SandboxOp::Pause)
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot pause sandbox 3 while it is paused");
    }
}
