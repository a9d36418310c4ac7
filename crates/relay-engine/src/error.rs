use std::time::Duration;

use relay_core::context::ContextError;
use relay_core::errors::ModelError;
use relay_core::ids::RunId;
use relay_core::state::RunStatus;

/// Errors surfaced by the engine's public API and run supervision.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid execution context: {0}")]
    InvalidContext(#[from] ContextError),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("run already registered: {0}")]
    DuplicateRun(RunId),

    #[error("model call failed after {attempts} attempts: {source}")]
    ModelCall {
        attempts: u32,
        #[source]
        source: ModelError,
    },

    #[error("run exceeded ceiling of {0:?}")]
    Timeout(Duration),

    #[error("run cancelled")]
    Cancelled,

    #[error("agent exceeded {0} steps without completing")]
    MaxStepsExceeded(u32),

    #[error("run {run_id} is already terminal ({status:?})")]
    TerminalState { run_id: RunId, status: RunStatus },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable reason string recorded in `ExecutionState.failure_reason` and
    /// carried by the terminal `agent_failed` event.
    pub fn failure_reason(&self) -> &'static str {
        match self {
            Self::InvalidContext(_) => "invalid_context",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::DuplicateRun(_) => "duplicate_run",
            Self::ModelCall { .. } => "model_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::MaxStepsExceeded(_) => "max_steps",
            Self::TerminalState { .. } => "terminal_state",
            Self::Internal(_) => "internal",
        }
    }
}
