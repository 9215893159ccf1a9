//! Worker agent — runs on every fleet instance.
//!
//! Core components:
//! - `agent` — pull / stage-in / execute / stage-out / ack control loop
//! - `exec` — script subprocess with timeout and captured output
//! - `lease` — background lease extension for the in-flight message
//! - `state` — agent state machine (Idle → StagingIn → … → Terminated)

pub mod agent;
pub mod exec;
pub mod lease;
pub mod state;

pub use agent::{AgentExit, AttemptOutcome, WorkerAgent, WorkerDeps};
pub use exec::{ScriptOutput, ScriptRunner};
pub use lease::LeaseKeeper;
pub use state::{AgentState, AgentStatus, StateTransition};
