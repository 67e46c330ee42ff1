//! Explicit confirmation state machine for destructive actions, decoupled
//! from any rendering layer.

use std::sync::{Mutex, MutexGuard, PoisonError};

use shared::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmState {
    Idle,
    Presented { prompt: String },
    Confirmed,
    Cancelled,
}

#[derive(Debug)]
pub struct ConfirmationGate {
    state: Mutex<ConfirmState>,
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConfirmState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConfirmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConfirmState {
        self.lock().clone()
    }

    /// Presents a prompt. Only one confirmation may be pending at a time.
    pub fn present(&self, prompt: impl Into<String>) -> Result<(), ClientError> {
        let mut state = self.lock();
        if matches!(*state, ConfirmState::Presented { .. }) {
            return Err(ClientError::Validation(
                "a confirmation is already pending".into(),
            ));
        }
        *state = ConfirmState::Presented {
            prompt: prompt.into(),
        };
        Ok(())
    }

    /// Resolves the presented prompt one way or the other.
    pub fn resolve(&self, accepted: bool) -> Result<(), ClientError> {
        let mut state = self.lock();
        if !matches!(*state, ConfirmState::Presented { .. }) {
            return Err(ClientError::Validation("no confirmation is pending".into()));
        }
        *state = if accepted {
            ConfirmState::Confirmed
        } else {
            ConfirmState::Cancelled
        };
        Ok(())
    }

    /// Consumes a resolved decision, returning the gate to idle. `None`
    /// while idle or still presented.
    pub fn take_decision(&self) -> Option<bool> {
        let mut state = self.lock();
        let decision = match *state {
            ConfirmState::Confirmed => Some(true),
            ConfirmState::Cancelled => Some(false),
            _ => return None,
        };
        *state = ConfirmState::Idle;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_presented_confirmed_idle_cycle() {
        let gate = ConfirmationGate::new();
        assert_eq!(gate.state(), ConfirmState::Idle);
        assert!(gate.take_decision().is_none());

        gate.present("Завершить сделку?").expect("present");
        assert!(matches!(gate.state(), ConfirmState::Presented { .. }));
        // Still unresolved.
        assert!(gate.take_decision().is_none());

        gate.resolve(true).expect("resolve");
        assert_eq!(gate.take_decision(), Some(true));
        assert_eq!(gate.state(), ConfirmState::Idle);
    }

    #[test]
    fn cancellation_is_a_decision_too() {
        let gate = ConfirmationGate::new();
        gate.present("Отменить сделку?").expect("present");
        gate.resolve(false).expect("resolve");
        assert_eq!(gate.take_decision(), Some(false));
    }

    #[test]
    fn rejects_double_presentation_and_stray_resolution() {
        let gate = ConfirmationGate::new();
        gate.present("first").expect("present");
        assert!(gate.present("second").is_err());

        let idle = ConfirmationGate::new();
        assert!(idle.resolve(true).is_err());
    }
}
