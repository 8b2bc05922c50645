//! Agent state machine: the process-wide operating mode and the events that move it.
//!
//! The transition table is static. Every `(state, event)` pair either maps to a next state
//! or is rejected with `InvalidTransition`, leaving the current state untouched. The machine
//! never schedules itself; the orchestrator and the background scheduler drive it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::error::{SentienceError, SentienceResult};

/// Transitions kept for diagnostics.
pub const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Idle,
    Listening,
    Processing,
    Executing,
    Reflecting,
    Sleeping,
    /// Terminal. Requires an external restart.
    Failed,
}

impl AgentState {
    pub const ALL: [AgentState; 8] = [
        AgentState::Initializing,
        AgentState::Idle,
        AgentState::Listening,
        AgentState::Processing,
        AgentState::Executing,
        AgentState::Reflecting,
        AgentState::Sleeping,
        AgentState::Failed,
    ];

    /// Subsystem actions permitted while in this state.
    pub fn allowed_actions(self) -> &'static [SubsystemAction] {
        use SubsystemAction::*;
        match self {
            AgentState::Initializing => &[Persist],
            AgentState::Idle => &[AcceptInput, DecayTick, Reflect, ProactiveCheck, Persist],
            AgentState::Listening => &[ApplyTriggers, DecayTick],
            AgentState::Processing => &[ApplyTriggers, CallInference, DecayTick],
            AgentState::Executing => &[ExecutePlan, ApplyTriggers, DecayTick, Persist],
            AgentState::Reflecting => &[Reflect, ApplyTriggers, DecayTick, Persist],
            AgentState::Sleeping => &[Dream, DecayTick, Persist],
            AgentState::Failed => &[],
        }
    }

    pub fn allows(self, action: SubsystemAction) -> bool {
        self.allowed_actions().contains(&action)
    }

    pub fn is_terminal(self) -> bool {
        self == AgentState::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Ready,
    InputReceived,
    InputResolved,
    PlanReady,
    NoActionNeeded,
    Done,
    Complete,
    IdleTimeoutLong,
    Wake,
    Fault,
    /// Internal: a scheduled cycle enters the pipeline without user input.
    CycleStarted,
}

impl AgentEvent {
    pub const ALL: [AgentEvent; 11] = [
        AgentEvent::Ready,
        AgentEvent::InputReceived,
        AgentEvent::InputResolved,
        AgentEvent::PlanReady,
        AgentEvent::NoActionNeeded,
        AgentEvent::Done,
        AgentEvent::Complete,
        AgentEvent::IdleTimeoutLong,
        AgentEvent::Wake,
        AgentEvent::Fault,
        AgentEvent::CycleStarted,
    ];
}

/// Work a subsystem may perform in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemAction {
    AcceptInput,
    ApplyTriggers,
    CallInference,
    ExecutePlan,
    Reflect,
    Dream,
    ProactiveCheck,
    DecayTick,
    Persist,
}

/// The static table. `None` means the pair is rejected.
pub fn next_state(state: AgentState, event: AgentEvent) -> Option<AgentState> {
    use AgentEvent as E;
    use AgentState as S;
    match (state, event) {
        (S::Failed, _) => None,
        (S::Initializing, E::Fault) => Some(S::Failed),
        (_, E::Fault) => Some(S::Idle),
        (S::Initializing, E::Ready) => Some(S::Idle),
        (S::Idle, E::InputReceived) => Some(S::Listening),
        (S::Idle, E::CycleStarted) => Some(S::Processing),
        (S::Idle, E::IdleTimeoutLong) => Some(S::Sleeping),
        (S::Listening, E::InputResolved) => Some(S::Processing),
        (S::Processing, E::PlanReady) => Some(S::Executing),
        (S::Processing, E::NoActionNeeded) => Some(S::Idle),
        (S::Executing, E::Done) => Some(S::Reflecting),
        (S::Reflecting, E::Complete) => Some(S::Idle),
        (S::Sleeping, E::Wake) => Some(S::Idle),
        _ => None,
    }
}

/// Result of an accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: AgentState,
    pub event: AgentEvent,
    pub to: AgentState,
    pub allowed: &'static [SubsystemAction],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub event: AgentEvent,
    pub to: AgentState,
    pub at: DateTime<Utc>,
}

/// Persisted form of the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineSnapshot {
    pub state: AgentState,
    pub entered_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

pub struct AgentStateMachine {
    state: AgentState,
    entered_at: DateTime<Utc>,
    history: VecDeque<TransitionRecord>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AgentStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStateMachine")
            .field("state", &self.state)
            .field("entered_at", &self.entered_at)
            .field("history", &self.history.len())
            .finish()
    }
}

impl AgentStateMachine {
    /// New machine in `Initializing`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let entered_at = clock.now();
        Self {
            state: AgentState::Initializing,
            entered_at,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            clock,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn time_in_state(&self) -> Duration {
        elapsed_between(self.entered_at, self.clock.now())
    }

    pub fn can_accept(&self, event: AgentEvent) -> bool {
        next_state(self.state, event).is_some()
    }

    pub fn allowed_actions(&self) -> &'static [SubsystemAction] {
        self.state.allowed_actions()
    }

    pub fn transition(&mut self, event: AgentEvent) -> SentienceResult<Transition> {
        let from = self.state;
        let Some(to) = next_state(from, event) else {
            debug!(target: "sentience::state", from = ?from, event = ?event, "transition rejected");
            return Err(SentienceError::InvalidTransition { from, event });
        };

        let at = self.clock.now();
        self.state = to;
        self.entered_at = at;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord { from, event, to, at });

        if to.is_terminal() {
            warn!(target: "sentience::state", from = ?from, event = ?event, "agent entered terminal Failed state");
        } else if event == AgentEvent::Fault {
            warn!(target: "sentience::state", from = ?from, "fault recovery to Idle");
        } else if matches!(event, AgentEvent::IdleTimeoutLong | AgentEvent::Wake) {
            info!(target: "sentience::state", from = ?from, to = ?to, "sleep state changed");
        } else {
            debug!(target: "sentience::state", from = ?from, event = ?event, to = ?to, "transition");
        }

        Ok(Transition {
            from,
            event,
            to,
            allowed: to.allowed_actions(),
        })
    }

    /// Applies `events` in order, stopping at the first rejection.
    pub fn transition_all(&mut self, events: &[AgentEvent]) -> SentienceResult<AgentState> {
        for event in events {
            self.transition(*event)?;
        }
        Ok(self.state)
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn snapshot(&self) -> StateMachineSnapshot {
        StateMachineSnapshot {
            state: self.state,
            entered_at: self.entered_at,
            history: self.history.iter().cloned().collect(),
        }
    }

    /// Adopts the persisted history. The live state is not restored: a restarted process
    /// always boots through `Initializing`.
    pub fn restore_history(&mut self, snapshot: &StateMachineSnapshot) {
        self.history = snapshot
            .history
            .iter()
            .rev()
            .take(HISTORY_LIMIT)
            .rev()
            .cloned()
            .collect();
    }
}
