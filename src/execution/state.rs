//! Lifecycle of a backgrounded run.

use crate::error::{Error, Result};

/// Where a [`Future`](super::Future) is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// Built but not spawned.
    #[default]
    NotStarted,
    /// Spawned; output is being drained.
    Running,
    /// Exited and its result recorded.
    Done,
}

impl RunState {
    /// Valid transitions:
    /// - NotStarted -> Running
    /// - Running -> Done
    /// - NotStarted -> Done (spawn failed)
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;
        matches!((*self, target), (NotStarted, Running) | (Running, Done) | (NotStarted, Done))
    }

    pub fn transition_to(&mut self, target: RunState) -> Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "invalid run transition {:?} -> {:?}",
                self, target
            )))
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut state = RunState::default();
        assert!(state.transition_to(RunState::Running).is_ok());
        assert!(state.transition_to(RunState::Done).is_ok());
        assert!(state.is_terminal());
    }

    #[test]
    fn test_no_way_back() {
        let mut state = RunState::Done;
        assert!(state.transition_to(RunState::Running).is_err());
        assert!(state.transition_to(RunState::NotStarted).is_err());
        assert_eq!(state, RunState::Done);
    }

    #[test]
    fn test_failed_spawn_goes_straight_to_done() {
        let mut state = RunState::NotStarted;
        assert!(state.can_transition_to(RunState::Done));
        assert!(!RunState::Running.can_transition_to(RunState::Running));
    }
}
