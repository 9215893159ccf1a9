//! Worker agent state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Waiting for a message.
    Idle,
    /// Fetching declared inputs into a fresh working directory.
    StagingIn,
    /// Script subprocess running.
    Executing,
    /// Uploading declared outputs.
    StagingOut,
    /// Settling the lease and removing the working directory.
    Completing,
    /// Queue confirmed drained; instance deletion requested.
    Terminating,
    /// Instance deletion accepted. Terminal.
    Terminated,
}

impl AgentState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        use AgentState::*;

        matches!(
            (self, target),
            (Idle, StagingIn) | (Idle, Terminating) |
            // Staging-in failure skips straight to Completing
            (StagingIn, Executing) | (StagingIn, Completing) |
            // Launch failure or timeout
            (Executing, StagingOut) | (Executing, Completing) |
            (StagingOut, Completing) |
            (Completing, Idle) |
            // Deletion refused by the control plane
            (Terminating, Terminated) | (Terminating, Idle)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::StagingIn => "staging_in",
            Self::Executing => "executing",
            Self::StagingOut => "staging_out",
            Self::Completing => "completing",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current state plus a bounded transition history.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
    /// Task attempts that reached Completing.
    pub attempts: u64,
    /// Attempts that ended with an acknowledgement.
    pub acknowledged: u64,
    pub transitions: Vec<StateTransition>,
}

impl AgentStatus {
    const MAX_TRANSITIONS: usize = 200;

    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            started_at: Utc::now(),
            attempts: 0,
            acknowledged: 0,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: AgentState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > Self::MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - Self::MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        if new_state == AgentState::Completing {
            self.attempts += 1;
        }
        self.state = new_state;
        Ok(())
    }

    /// States visited, oldest first, starting from the first recorded `from`.
    pub fn path(&self) -> Vec<AgentState> {
        let mut path: Vec<AgentState> = self.transitions.first().map(|t| t.from).into_iter().collect();
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::new()
    }
}
