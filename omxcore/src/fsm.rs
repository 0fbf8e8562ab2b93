//! The component state machine.
//!
//! Stable states plus one explicit substate per multi-step transition. The
//! state-set protocol is table driven: rows are the current stable state,
//! columns the requested one, row and column 0 are reserved so the table
//! can be indexed with the IL state numbering directly. A cell either
//! rejects the request, completes it synchronously, or names the micro-step
//! the kernel and processor must run; in the latter case the FSM enters the
//! matching substate and waits for the kernel to observe the completion
//! predicate (all populated, all depopulated, all buffers returned).

use tracing::{debug, warn};

use omxil::{IlError, IlResult, State};

/// Stable states and transition substates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Loaded,
    WaitForResources,
    Idle,
    Executing,
    Pause,
    LoadedToIdle,
    IdleToLoaded,
    IdleToExecuting,
    ExecutingToIdle,
    PauseToIdle,
    ExecutingToPause,
    IdleToPause,
    PauseToExecuting,
}

impl FsmState {
    /// The stable state reported by `GetState` while in this state. A
    /// substate reports its origin until the transition completes.
    pub fn stable(self) -> State {
        match self {
            FsmState::Loaded | FsmState::LoadedToIdle => State::Loaded,
            FsmState::WaitForResources => State::WaitForResources,
            FsmState::Idle
            | FsmState::IdleToLoaded
            | FsmState::IdleToExecuting
            | FsmState::IdleToPause => State::Idle,
            FsmState::Executing | FsmState::ExecutingToIdle | FsmState::ExecutingToPause => {
                State::Executing
            }
            FsmState::Pause | FsmState::PauseToIdle | FsmState::PauseToExecuting => State::Pause,
        }
    }

    pub fn is_substate(self) -> bool {
        !matches!(
            self,
            FsmState::Loaded
                | FsmState::WaitForResources
                | FsmState::Idle
                | FsmState::Executing
                | FsmState::Pause
        )
    }

    /// The stable state a substate is heading to.
    pub fn target(self) -> Option<State> {
        match self {
            FsmState::LoadedToIdle | FsmState::ExecutingToIdle | FsmState::PauseToIdle => {
                Some(State::Idle)
            }
            FsmState::IdleToLoaded => Some(State::Loaded),
            FsmState::IdleToExecuting | FsmState::PauseToExecuting => Some(State::Executing),
            FsmState::ExecutingToPause | FsmState::IdleToPause => Some(State::Pause),
            _ => None,
        }
    }
}

/// What a state-set table cell asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// The cell is not a legal transition.
    Invalid,
    /// Completes synchronously, no kernel work.
    Immediate,
    LoadedToIdle,
    IdleToLoaded,
    ExeOrPauseToIdle,
    IdleToExe,
    PauseToExe,
    /// Executing to Executing re-runs the transfer machinery without a
    /// completion event.
    ExeToExe,
    ExeOrIdleToPause,
}

/// Row/column 0 reserved; indexed by [`State::table_index`].
const STATE_SET_TABLE: [[TransitionKind; 6]; 6] = {
    use TransitionKind::*;
    [
        // From reserved
        [Invalid, Invalid, Invalid, Invalid, Invalid, Invalid],
        // From Loaded
        [Invalid, Invalid, LoadedToIdle, Invalid, Invalid, Immediate],
        // From Idle
        [
            Invalid,
            IdleToLoaded,
            Invalid,
            IdleToExe,
            ExeOrIdleToPause,
            Invalid,
        ],
        // From Executing
        [
            Invalid,
            Invalid,
            ExeOrPauseToIdle,
            ExeToExe,
            ExeOrIdleToPause,
            Invalid,
        ],
        // From Pause
        [
            Invalid,
            Invalid,
            ExeOrPauseToIdle,
            PauseToExe,
            Invalid,
            Invalid,
        ],
        // From WaitForResources
        [Invalid, Immediate, Invalid, Invalid, Invalid, Invalid],
    ]
};

pub struct Fsm {
    state: FsmState,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            state: FsmState::Loaded,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn current_state(&self) -> State {
        self.state.stable()
    }

    pub fn in_substate(&self) -> bool {
        self.state.is_substate()
    }

    /// Looks up the requested transition and, for a multi-step one, enters
    /// the matching substate. The caller runs the micro-step and later
    /// calls [`Fsm::complete_transition`] when the kernel's predicate
    /// clears.
    pub fn begin_transition(&mut self, requested: State) -> IlResult<TransitionKind> {
        if self.state.is_substate() {
            warn!(state = ?self.state, %requested, "state set while transition in flight");
            return Err(IlError::IncorrectStateTransition);
        }
        let current = self.state.stable();
        let kind = STATE_SET_TABLE[current.table_index()][requested.table_index()];
        if kind == TransitionKind::Invalid {
            return if current == requested {
                Err(IlError::SameState)
            } else {
                Err(IlError::IncorrectStateTransition)
            };
        }

        let next = match kind {
            TransitionKind::LoadedToIdle => Some(FsmState::LoadedToIdle),
            TransitionKind::IdleToLoaded => Some(FsmState::IdleToLoaded),
            TransitionKind::IdleToExe => Some(FsmState::IdleToExecuting),
            TransitionKind::PauseToExe => Some(FsmState::PauseToExecuting),
            TransitionKind::ExeOrPauseToIdle => Some(if current == State::Executing {
                FsmState::ExecutingToIdle
            } else {
                FsmState::PauseToIdle
            }),
            TransitionKind::ExeOrIdleToPause => Some(if current == State::Executing {
                FsmState::ExecutingToPause
            } else {
                FsmState::IdleToPause
            }),
            TransitionKind::Immediate | TransitionKind::ExeToExe | TransitionKind::Invalid => None,
        };
        if let Some(next) = next {
            debug!(from = ?self.state, to = ?next, "transition started");
            self.state = next;
        }
        Ok(kind)
    }

    /// Settles an immediate transition (`TransitionKind::Immediate`).
    pub fn settle(&mut self, state: State) {
        self.state = stable_to_fsm(state);
    }

    /// Called by the kernel/component glue when the pending transition's
    /// completion predicate holds.
    pub fn complete_transition(&mut self, to: State) -> IlResult<()> {
        match self.state.target() {
            Some(target) if target == to => {
                debug!(from = ?self.state, %to, "transition complete");
                self.state = stable_to_fsm(to);
                Ok(())
            }
            _ => {
                warn!(state = ?self.state, %to, "unexpected transition completion");
                Err(IlError::IncorrectStateTransition)
            }
        }
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

fn stable_to_fsm(state: State) -> FsmState {
    match state {
        State::Loaded => FsmState::Loaded,
        State::WaitForResources => FsmState::WaitForResources,
        State::Idle => FsmState::Idle,
        State::Executing => FsmState::Executing,
        State::Pause => FsmState::Pause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_to_idle_enters_substate() {
        let mut fsm = Fsm::new();
        let kind = fsm.begin_transition(State::Idle).unwrap();
        assert_eq!(kind, TransitionKind::LoadedToIdle);
        assert_eq!(fsm.state(), FsmState::LoadedToIdle);
        // Still reports Loaded until the buffers arrive.
        assert_eq!(fsm.current_state(), State::Loaded);

        fsm.complete_transition(State::Idle).unwrap();
        assert_eq!(fsm.current_state(), State::Idle);
    }

    #[test]
    fn test_invalid_and_same_state() {
        let mut fsm = Fsm::new();
        assert_eq!(
            fsm.begin_transition(State::Executing),
            Err(IlError::IncorrectStateTransition)
        );
        assert_eq!(fsm.begin_transition(State::Loaded), Err(IlError::SameState));
    }

    #[test]
    fn test_state_set_while_in_flight_is_rejected() {
        let mut fsm = Fsm::new();
        fsm.begin_transition(State::Idle).unwrap();
        assert_eq!(
            fsm.begin_transition(State::Loaded),
            Err(IlError::IncorrectStateTransition)
        );
    }

    #[test]
    fn test_pause_paths() {
        let mut fsm = Fsm::new();
        fsm.begin_transition(State::Idle).unwrap();
        fsm.complete_transition(State::Idle).unwrap();
        fsm.begin_transition(State::Executing).unwrap();
        fsm.complete_transition(State::Executing).unwrap();

        assert_eq!(
            fsm.begin_transition(State::Pause).unwrap(),
            TransitionKind::ExeOrIdleToPause
        );
        assert_eq!(fsm.state(), FsmState::ExecutingToPause);
        fsm.complete_transition(State::Pause).unwrap();

        assert_eq!(
            fsm.begin_transition(State::Executing).unwrap(),
            TransitionKind::PauseToExe
        );
        assert_eq!(fsm.state(), FsmState::PauseToExecuting);
        fsm.complete_transition(State::Executing).unwrap();

        assert_eq!(
            fsm.begin_transition(State::Idle).unwrap(),
            TransitionKind::ExeOrPauseToIdle
        );
        assert_eq!(fsm.state(), FsmState::ExecutingToIdle);
    }

    #[test]
    fn test_wait_for_resources_is_immediate() {
        let mut fsm = Fsm::new();
        assert_eq!(
            fsm.begin_transition(State::WaitForResources).unwrap(),
            TransitionKind::Immediate
        );
        fsm.settle(State::WaitForResources);
        assert_eq!(
            fsm.begin_transition(State::Loaded).unwrap(),
            TransitionKind::Immediate
        );
        fsm.settle(State::Loaded);
        assert_eq!(fsm.current_state(), State::Loaded);
    }

    #[test]
    fn test_exe_to_exe_has_no_substate() {
        let mut fsm = Fsm::new();
        fsm.begin_transition(State::Idle).unwrap();
        fsm.complete_transition(State::Idle).unwrap();
        fsm.begin_transition(State::Executing).unwrap();
        fsm.complete_transition(State::Executing).unwrap();

        assert_eq!(
            fsm.begin_transition(State::Executing).unwrap(),
            TransitionKind::ExeToExe
        );
        assert_eq!(fsm.state(), FsmState::Executing);
    }
}
