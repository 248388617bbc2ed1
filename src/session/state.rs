//! Shell session lifecycle.

use crate::error::{Error, Result};

/// Lifecycle state of a [`ShellSession`](super::ShellSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Spawned, startup banner not drained yet.
    #[default]
    Starting,
    /// A command is in flight.
    Running,
    /// Waiting for the next command.
    Idle,
    /// Closed or dead; cannot be reused.
    Closed,
}

impl SessionState {
    /// Valid transitions:
    /// - Starting -> Running (startup probe)
    /// - Running -> Idle
    /// - Idle -> Running
    /// - any -> Closed
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Starting, Running) | (Running, Idle) | (Idle, Running) | (Starting | Running | Idle, Closed)
        )
    }

    pub fn transition_to(&mut self, target: SessionState) -> Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(Error::Session(format!(
                "invalid session transition {:?} -> {:?}",
                self, target
            )))
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut state = SessionState::default();
        state.transition_to(SessionState::Running).unwrap();
        state.transition_to(SessionState::Idle).unwrap();
        state.transition_to(SessionState::Running).unwrap();
        state.transition_to(SessionState::Closed).unwrap();
        assert!(!state.is_alive());
    }

    #[test]
    fn test_invalid_from_closed() {
        let mut state = SessionState::Closed;
        assert!(state.transition_to(SessionState::Running).is_err());
        assert!(state.transition_to(SessionState::Closed).is_err());
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_running_twice_is_rejected() {
        let mut state = SessionState::Running;
        assert!(matches!(
            state.transition_to(SessionState::Running),
            Err(Error::Session(_))
        ));
    }
}
