//! Responder state machine.
//!
//! The responder cycles `IDLE → WAITING → REACTING → IDLE`. A wait that
//! times out or is interrupted returns to `IDLE` so the stop flag can be
//! checked. `SHUTTING_DOWN` is terminal and reachable from every state.

use crate::error::{RttError, RttResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Responder lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponderState {
    /// No outstanding wait.
    #[default]
    Idle,
    /// Blocked (or polling) on the input line.
    WaitingForEdge,
    /// Output asserted; waiting for the input to return inactive.
    Reacting,
    /// Terminal: output deasserted, lines being released.
    ShuttingDown,
}

impl fmt::Display for ResponderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::WaitingForEdge => write!(f, "WAITING_FOR_EDGE"),
            Self::Reacting => write!(f, "REACTING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
        }
    }
}

impl ResponderState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ResponderState) -> bool {
        use ResponderState::{Idle, Reacting, ShuttingDown, WaitingForEdge};

        matches!(
            (self, target),
            (Idle, WaitingForEdge)
                | (WaitingForEdge, Reacting)
                // Timeout, interruption, or a falling edge with nothing to undo
                | (WaitingForEdge, Idle)
                | (Reacting, Idle)
                | (Idle | WaitingForEdge | Reacting, ShuttingDown)
        )
    }

    /// Returns true once the responder has begun shutting down.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: ResponderState,
    previous: Option<ResponderState>,
    transition_count: u64,
}

impl StateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ResponderState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ResponderState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`RttError::InvalidStateTransition`] if the edge is not allowed.
    pub fn transition(&mut self, target: ResponderState) -> RttResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(RttError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Enter SHUTTING_DOWN; a no-op if already there.
    pub fn enter_shutdown(&mut self) {
        if self.current.can_transition_to(ResponderState::ShuttingDown) {
            self.previous = Some(self.current);
            self.current = ResponderState::ShuttingDown;
            self.transition_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), ResponderState::Idle);

        sm.transition(ResponderState::WaitingForEdge).unwrap();
        sm.transition(ResponderState::Reacting).unwrap();
        sm.transition(ResponderState::Idle).unwrap();

        assert_eq!(sm.state(), ResponderState::Idle);
        assert_eq!(sm.previous_state(), Some(ResponderState::Reacting));
        assert_eq!(sm.transition_count(), 3);
    }

    #[test]
    fn test_timeout_returns_to_idle() {
        let mut sm = StateMachine::new();
        sm.transition(ResponderState::WaitingForEdge).unwrap();
        assert!(sm.transition(ResponderState::Idle).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = StateMachine::new();
        // Cannot react without waiting first
        assert!(sm.transition(ResponderState::Reacting).is_err());

        sm.transition(ResponderState::WaitingForEdge).unwrap();
        sm.transition(ResponderState::Reacting).unwrap();
        // Output must be deasserted (IDLE) before the next wait
        assert!(sm.transition(ResponderState::WaitingForEdge).is_err());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut sm = StateMachine::new();
        sm.transition(ResponderState::WaitingForEdge).unwrap();
        sm.enter_shutdown();
        assert!(sm.state().is_terminal());

        let count = sm.transition_count();
        sm.enter_shutdown();
        assert_eq!(sm.transition_count(), count);
        assert!(sm.transition(ResponderState::Idle).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ResponderState::WaitingForEdge.to_string(), "WAITING_FOR_EDGE");
        assert_eq!(ResponderState::ShuttingDown.to_string(), "SHUTTING_DOWN");
    }
}
