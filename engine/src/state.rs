//! Pipeline state machine.
//!
//! Commands move a session into an intermittent state (`Starting`,
//! `Pausing`, ...). Once the pipeline has acted on the command it calls
//! [`SyncStateMachine::command_transit_finished`] to land in the matching
//! stable state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineState {
    #[default]
    Default,
    Starting,
    Running,
    Pausing,
    Paused,
    PausingForConflict,
    PausedByConflict,
    StoppingSingleTrip,
    StoppedSingleTrip,
    Stopping,
    Stopped,
}

impl PipelineState {
    /// States that only exist while a command is being carried out.
    pub fn is_intermittent(&self) -> bool {
        matches!(
            self,
            PipelineState::Starting
                | PipelineState::Pausing
                | PipelineState::PausingForConflict
                | PipelineState::StoppingSingleTrip
                | PipelineState::Stopping
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PipelineState::Paused | PipelineState::PausedByConflict)
    }

    pub fn is_terminal(&self) -> bool {
        *self == PipelineState::Stopped
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineSyncCommand {
    Start,
    StartNewTrip,
    Pause,
    PauseForConflict,
    Resume,
    Stop,
    StopCurrentTrip,
    Finish,
}

impl fmt::Display for PipelineSyncCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transition table. `None` means the command is rejected in that state.
pub fn transition(from: PipelineState, command: PipelineSyncCommand) -> Option<PipelineState> {
    use PipelineState as S;
    use PipelineSyncCommand as C;

    match (from, command) {
        // Stop and finish win from everywhere except a finished session.
        (S::Stopped, C::Stop | C::Finish) => Some(S::Stopped),
        (S::Stopped, _) => None,
        (_, C::Stop | C::Finish) => Some(S::Stopping),

        (S::Stopping, C::StopCurrentTrip) => Some(S::Stopping),
        (S::Stopping, _) => None,

        (S::Default, C::Start | C::StartNewTrip) => Some(S::Starting),
        (S::Default, C::Pause) => Some(S::Pausing),
        (S::Default, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::Default, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::Default, C::Resume) => None,

        (S::Starting, C::Start | C::StartNewTrip) => Some(S::Starting),
        (S::Starting, C::Pause) => Some(S::Pausing),
        (S::Starting, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::Starting, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::Starting, C::Resume) => None,

        (S::Running, C::Start | C::StartNewTrip | C::Resume) => Some(S::Running),
        (S::Running, C::Pause) => Some(S::Pausing),
        (S::Running, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::Running, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),

        (S::Pausing, C::Pause) => Some(S::Pausing),
        (S::Pausing, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::Pausing, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::Pausing, C::Resume | C::Start | C::StartNewTrip) => None,

        (S::Paused, C::Pause) => Some(S::Paused),
        (S::Paused, C::Resume) => Some(S::Starting),
        (S::Paused, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::Paused, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::Paused, C::Start | C::StartNewTrip) => None,

        (S::PausingForConflict, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::PausingForConflict, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::PausingForConflict, _) => None,

        (S::PausedByConflict, C::PauseForConflict) => Some(S::PausedByConflict),
        (S::PausedByConflict, C::Resume) => Some(S::Starting),
        (S::PausedByConflict, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::PausedByConflict, _) => None,

        (S::StoppingSingleTrip, C::Pause) => Some(S::Pausing),
        (S::StoppingSingleTrip, C::StopCurrentTrip) => Some(S::StoppingSingleTrip),
        (S::StoppingSingleTrip, _) => None,

        (S::StoppedSingleTrip, C::Pause) => Some(S::Pausing),
        (S::StoppedSingleTrip, C::StartNewTrip) => Some(S::Starting),
        (S::StoppedSingleTrip, C::StopCurrentTrip) => Some(S::StoppedSingleTrip),
        (S::StoppedSingleTrip, C::PauseForConflict) => Some(S::PausingForConflict),
        (S::StoppedSingleTrip, C::Resume | C::Start) => None,
    }
}

/// Stable state an intermittent state settles into.
pub fn settled(state: PipelineState) -> PipelineState {
    match state {
        PipelineState::Starting => PipelineState::Running,
        PipelineState::Pausing => PipelineState::Paused,
        PipelineState::PausingForConflict => PipelineState::PausedByConflict,
        PipelineState::StoppingSingleTrip => PipelineState::StoppedSingleTrip,
        PipelineState::Stopping => PipelineState::Stopped,
        stable => stable,
    }
}

/// Thread-safe holder of one session's pipeline state.
#[derive(Debug, Default)]
pub struct SyncStateMachine {
    state: Mutex<PipelineState>,
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> PipelineState {
        *self.guard()
    }

    /// Apply a command. Rejected commands leave the state unchanged.
    pub fn try_transit(&self, command: PipelineSyncCommand) -> Result<PipelineState> {
        let mut state = self.guard();
        let from = *state;
        match transition(from, command) {
            Some(next) => {
                tracing::debug!(%from, to = %next, %command, "state transition");
                *state = next;
                Ok(next)
            }
            None => Err(Error::InvalidTransition {
                from: state.to_string(),
                command: command.to_string(),
            }),
        }
    }

    /// Settle an intermittent state. Stable states are left as they are.
    pub fn command_transit_finished(&self) -> PipelineState {
        let mut state = self.guard();
        *state = settled(*state);
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState as S;
    use PipelineSyncCommand as C;

    const ALL_STATES: [PipelineState; 11] = [
        S::Default,
        S::Starting,
        S::Running,
        S::Pausing,
        S::Paused,
        S::PausingForConflict,
        S::PausedByConflict,
        S::StoppingSingleTrip,
        S::StoppedSingleTrip,
        S::Stopping,
        S::Stopped,
    ];

    #[test]
    fn stop_wins_from_any_state() {
        for state in ALL_STATES {
            let expected = if state == S::Stopped { S::Stopped } else { S::Stopping };
            assert_eq!(transition(state, C::Stop), Some(expected));
            assert_eq!(transition(state, C::Finish), Some(expected));
        }
    }

    #[test]
    fn stopped_is_terminal() {
        for command in [C::Start, C::StartNewTrip, C::Pause, C::PauseForConflict, C::Resume, C::StopCurrentTrip] {
            assert_eq!(transition(S::Stopped, command), None);
        }
    }

    #[test]
    fn resume_rules() {
        assert_eq!(transition(S::Default, C::Resume), None);
        assert_eq!(transition(S::Running, C::Resume), Some(S::Running));
        assert_eq!(transition(S::Paused, C::Resume), Some(S::Starting));
        assert_eq!(transition(S::PausedByConflict, C::Resume), Some(S::Starting));
        assert_eq!(transition(S::StoppedSingleTrip, C::Resume), None);
    }

    #[test]
    fn paused_session_rejects_start() {
        assert_eq!(transition(S::Paused, C::Start), None);
        assert_eq!(transition(S::Paused, C::Pause), Some(S::Paused));
    }

    #[test]
    fn single_trip_transitions() {
        assert_eq!(transition(S::Running, C::StopCurrentTrip), Some(S::StoppingSingleTrip));
        assert_eq!(transition(S::StoppedSingleTrip, C::StartNewTrip), Some(S::Starting));
        assert_eq!(transition(S::StoppedSingleTrip, C::Start), None);
        assert_eq!(transition(S::Stopping, C::StopCurrentTrip), Some(S::Stopping));
    }

    #[test]
    fn every_intermittent_state_settles_to_a_stable_one() {
        for state in ALL_STATES {
            let stable = settled(state);
            assert!(!stable.is_intermittent(), "{state} settled to {stable}");
            if !state.is_intermittent() {
                assert_eq!(stable, state);
            }
        }
    }

    #[test]
    fn machine_two_phase_transition() {
        let machine = SyncStateMachine::new();
        assert_eq!(machine.try_transit(C::Start).unwrap(), S::Starting);
        assert_eq!(machine.command_transit_finished(), S::Running);
        assert_eq!(machine.try_transit(C::PauseForConflict).unwrap(), S::PausingForConflict);
        assert_eq!(machine.command_transit_finished(), S::PausedByConflict);

        let err = machine.try_transit(C::Start).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidTransition {
                from: "PausedByConflict".into(),
                command: "Start".into()
            }
        );
        assert_eq!(machine.current(), S::PausedByConflict);

        machine.try_transit(C::Resume).unwrap();
        assert_eq!(machine.command_transit_finished(), S::Running);
        machine.try_transit(C::Stop).unwrap();
        assert_eq!(machine.command_transit_finished(), S::Stopped);
        assert!(machine.current().is_terminal());
    }
}
