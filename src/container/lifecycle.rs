use crate::error::ScmError;
use serde::{Deserialize, Serialize};

/// Container lifecycle states, ordered by rank. The rank never decreases
/// over a container's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContainerState {
    Open,
    Closing,
    QuasiClosed,
    Closed,
    Deleting,
    Deleted,
}

impl ContainerState {
    pub fn rank(self) -> u8 {
        match self {
            ContainerState::Open => 0,
            ContainerState::Closing => 1,
            ContainerState::QuasiClosed => 2,
            ContainerState::Closed => 3,
            ContainerState::Deleting => 4,
            ContainerState::Deleted => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerState::Closed | ContainerState::Deleted)
    }
}

/// Events that drive the container FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Finalize,
    QuasiClose,
    Close,
    ForceClose,
    Delete,
    Cleanup,
}

impl LifecycleEvent {
    fn source(self) -> ContainerState {
        match self {
            LifecycleEvent::Finalize => ContainerState::Open,
            LifecycleEvent::QuasiClose => ContainerState::Closing,
            LifecycleEvent::Close => ContainerState::Closing,
            LifecycleEvent::ForceClose => ContainerState::QuasiClosed,
            LifecycleEvent::Delete => ContainerState::Closed,
            LifecycleEvent::Cleanup => ContainerState::Deleting,
        }
    }

    fn target(self) -> ContainerState {
        match self {
            LifecycleEvent::Finalize => ContainerState::Closing,
            LifecycleEvent::QuasiClose => ContainerState::QuasiClosed,
            LifecycleEvent::Close => ContainerState::Closed,
            LifecycleEvent::ForceClose => ContainerState::Closed,
            LifecycleEvent::Delete => ContainerState::Deleting,
            LifecycleEvent::Cleanup => ContainerState::Deleted,
        }
    }
}

/// Applies `event` to `current`. An event whose target has already been
/// reached or passed is an idempotent no-op; otherwise the container must sit
/// exactly at the event's source state.
pub fn next_state(
    current: ContainerState,
    event: LifecycleEvent,
) -> Result<ContainerState, ScmError> {
    let target = event.target();
    if current.rank() >= target.rank() {
        return Ok(current);
    }
    if current == event.source() {
        return Ok(target);
    }
    Err(ScmError::invalid_transition(format!(
        "{event:?} not applicable in state {current:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_through_close() {
        let mut state = ContainerState::Open;
        for event in [LifecycleEvent::Finalize, LifecycleEvent::Close] {
            state = next_state(state, event).unwrap();
        }
        assert_eq!(state, ContainerState::Closed);
        assert!(state.is_terminal());
    }

    #[test]
    fn quasi_close_path() {
        let mut state = ContainerState::Open;
        for event in [
            LifecycleEvent::Finalize,
            LifecycleEvent::QuasiClose,
            LifecycleEvent::ForceClose,
        ] {
            state = next_state(state, event).unwrap();
        }
        assert_eq!(state, ContainerState::Closed);
    }

    #[test]
    fn delete_path_to_terminal() {
        let mut state = ContainerState::Closed;
        state = next_state(state, LifecycleEvent::Delete).unwrap();
        assert_eq!(state, ContainerState::Deleting);
        state = next_state(state, LifecycleEvent::Cleanup).unwrap();
        assert_eq!(state, ContainerState::Deleted);
        assert!(state.is_terminal());
    }

    #[test]
    fn force_close_from_open_is_rejected() {
        let err = next_state(ContainerState::Open, LifecycleEvent::ForceClose).unwrap_err();
        assert!(matches!(err, ScmError::InvalidStateTransition { .. }));
    }

    #[test]
    fn passed_states_absorb_events() {
        // FINALIZE against an already-closed container is a no-op.
        assert_eq!(
            next_state(ContainerState::Closed, LifecycleEvent::Finalize).unwrap(),
            ContainerState::Closed
        );
        // CLOSE repeated after CLOSED holds.
        assert_eq!(
            next_state(ContainerState::Closed, LifecycleEvent::Close).unwrap(),
            ContainerState::Closed
        );
        // CLEANUP after DELETED holds.
        assert_eq!(
            next_state(ContainerState::Deleted, LifecycleEvent::Cleanup).unwrap(),
            ContainerState::Deleted
        );
    }

    #[test]
    fn delete_requires_closed() {
        let err = next_state(ContainerState::Closing, LifecycleEvent::Delete).unwrap_err();
        assert!(matches!(err, ScmError::InvalidStateTransition { .. }));
    }

    #[test]
    fn rank_is_monotone_over_every_accepted_event() {
        let states = [
            ContainerState::Open,
            ContainerState::Closing,
            ContainerState::QuasiClosed,
            ContainerState::Closed,
            ContainerState::Deleting,
            ContainerState::Deleted,
        ];
        let events = [
            LifecycleEvent::Finalize,
            LifecycleEvent::QuasiClose,
            LifecycleEvent::Close,
            LifecycleEvent::ForceClose,
            LifecycleEvent::Delete,
            LifecycleEvent::Cleanup,
        ];
        for state in states {
            for event in events {
                if let Ok(next) = next_state(state, event) {
                    assert!(next.rank() >= state.rank());
                }
            }
        }
    }
}
