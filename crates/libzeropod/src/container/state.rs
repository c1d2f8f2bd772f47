//! Scale state of a managed container.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The state a managed container is in. A container is always in exactly one
/// of these and only moves along the edges checked by
/// [`ScaleState::can_transition`].
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScaleState {
    // The container process is live and serving
    #[default]
    Running,
    // A checkpoint is being taken
    ScalingDown,
    // Process is gone, checkpoint on disk, activator bound
    ScaledDown,
    // A process is being reconstructed from the checkpoint
    Restoring,
    // Kill or delete in progress
    Terminating,
    // Final state, nothing left to do
    Terminated,
}

impl ScaleState {
    pub fn can_transition(&self, to: ScaleState) -> bool {
        use ScaleState::*;
        matches!(
            (self, to),
            (Running, ScalingDown)
                | (Running, Terminating)
                | (ScalingDown, ScaledDown)
                | (ScalingDown, Running)
                | (ScalingDown, Terminating)
                | (ScaledDown, Restoring)
                | (ScaledDown, Terminating)
                | (Restoring, Running)
                | (Restoring, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn can_scale_down(&self) -> bool {
        matches!(self, ScaleState::Running)
    }

    pub fn can_restore(&self) -> bool {
        matches!(self, ScaleState::ScaledDown)
    }

    /// The activator is bound exactly while the process is absent or still
    /// being brought back.
    pub fn activator_bound(&self) -> bool {
        matches!(self, ScaleState::ScaledDown | ScaleState::Restoring)
    }

    /// Whether a checkpoint exists on disk in this state.
    pub fn has_checkpoint(&self) -> bool {
        matches!(self, ScaleState::ScaledDown | ScaleState::Restoring)
    }

    /// Exits observed in these states are the checkpoint's own doing and
    /// must not surface as container exits.
    pub fn suppress_exits(&self) -> bool {
        matches!(self, ScaleState::ScalingDown | ScaleState::ScaledDown)
    }
}

impl Display for ScaleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Running => "Running",
            Self::ScalingDown => "ScalingDown",
            Self::ScaledDown => "ScaledDown",
            Self::Restoring => "Restoring",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
        };

        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: ScaleState, to: ScaleState },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ScaleState::*;

    const ALL: [ScaleState; 6] = [
        Running,
        ScalingDown,
        ScaledDown,
        Restoring,
        Terminating,
        Terminated,
    ];

    #[test]
    fn test_running() {
        assert!(Running.can_scale_down());
        assert!(!Running.can_restore());
        assert!(!Running.activator_bound());
        assert!(!Running.has_checkpoint());
    }

    #[test]
    fn test_scaled_down() {
        assert!(!ScaledDown.can_scale_down());
        assert!(ScaledDown.can_restore());
        assert!(ScaledDown.activator_bound());
        assert!(ScaledDown.has_checkpoint());
        assert!(ScaledDown.suppress_exits());
    }

    #[test]
    fn test_restoring() {
        assert!(Restoring.activator_bound());
        assert!(Restoring.has_checkpoint());
        assert!(!Restoring.suppress_exits());
    }

    #[test]
    fn test_terminated_is_final() {
        for to in ALL {
            assert!(!Terminated.can_transition(to));
        }
    }

    #[test]
    fn test_no_self_transitions() {
        for state in ALL {
            assert!(!state.can_transition(state));
        }
    }

    #[test]
    fn test_scale_down_cycle() {
        assert!(Running.can_transition(ScalingDown));
        assert!(ScalingDown.can_transition(ScaledDown));
        assert!(ScaledDown.can_transition(Restoring));
        assert!(Restoring.can_transition(Running));
    }

    #[test]
    fn test_checkpoint_failure_recovers() {
        assert!(ScalingDown.can_transition(Running));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Running.can_transition(ScaledDown));
        assert!(!ScaledDown.can_transition(Running));
        assert!(!Running.can_transition(Restoring));
        assert!(!Terminating.can_transition(Running));
    }
}
