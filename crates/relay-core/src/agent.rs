use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::ids::ToolCallId;
use crate::tools::ToolExecutionResult;

/// A tool invocation requested by an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: ToolCallId,
    pub name: String,
    pub parameters: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            parameters,
        }
    }
}

/// What an agent yields from one step of its loop.
#[derive(Clone, Debug)]
pub enum AgentStep {
    /// A reasoning fragment, surfaced to the user as progress.
    Thinking { fragment: String },
    /// A request to invoke a tool; the result is fed back via `TurnState`.
    ToolCall { request: ToolCallRequest },
    /// The run's final result.
    Complete { result: serde_json::Value },
}

/// Accumulated state of one run, visible to the agent on every step.
/// Tool results (including failures) are appended in invocation order so the
/// agent can retry or fall back instead of the run aborting.
#[derive(Clone, Debug, Default)]
pub struct TurnState {
    pub input: serde_json::Value,
    pub observations: Vec<ToolExecutionResult>,
    pub steps_taken: u32,
}

impl TurnState {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            input,
            observations: Vec::new(),
            steps_taken: 0,
        }
    }

    pub fn last_observation(&self) -> Option<&ToolExecutionResult> {
        self.observations.last()
    }
}

/// An opaque agent capability. The engine drives it step by step; the
/// concrete model call behind `next_step` is an external concern.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn next_step(&self, turn: &TurnState) -> Result<AgentStep, ModelError>;
}

/// Creates agent instances on demand when a session has no instance for a
/// requested name yet.
pub trait AgentFactory: Send + Sync {
    fn agent_name(&self) -> &str;
    fn create(&self) -> std::sync::Arc<dyn Agent>;
}
