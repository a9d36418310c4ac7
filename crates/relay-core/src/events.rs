use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::ids::{RunId, ToolCallId, UserId};

/// Lifecycle events streamed to the owning user's channel during a run.
///
/// Invariants enforced by the engine:
/// - `AgentStarted` is always the first event of a run.
/// - Exactly one terminal event (`AgentCompleted` or `AgentFailed`) is last;
///   nothing follows it.
/// - Every `ToolExecuting` is paired, before the terminal event, with exactly
///   one `ToolCompleted` or `ToolError` carrying the same `tool_call_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "agent_started")]
    AgentStarted {
        user_id: UserId,
        run_id: RunId,
        agent_name: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "agent_thinking")]
    AgentThinking {
        user_id: UserId,
        run_id: RunId,
        /// Per-run monotonic counter so clients can detect dropped events.
        sequence: u64,
        fragment: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "tool_executing")]
    ToolExecuting {
        user_id: UserId,
        run_id: RunId,
        tool_call_id: ToolCallId,
        tool_name: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "tool_completed")]
    ToolCompleted {
        user_id: UserId,
        run_id: RunId,
        tool_call_id: ToolCallId,
        tool_name: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "tool_error")]
    ToolError {
        user_id: UserId,
        run_id: RunId,
        tool_call_id: ToolCallId,
        tool_name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "agent_completed")]
    AgentCompleted {
        user_id: UserId,
        run_id: RunId,
        result: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "agent_failed")]
    AgentFailed {
        user_id: UserId,
        run_id: RunId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn agent_started(ctx: &ExecutionContext, agent_name: &str) -> Self {
        Self::AgentStarted {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            agent_name: agent_name.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent_thinking(ctx: &ExecutionContext, sequence: u64, fragment: String) -> Self {
        Self::AgentThinking {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            sequence,
            fragment,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_executing(ctx: &ExecutionContext, call_id: &ToolCallId, tool_name: &str) -> Self {
        Self::ToolExecuting {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            tool_call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn tool_completed(
        ctx: &ExecutionContext,
        call_id: &ToolCallId,
        tool_name: &str,
        duration_ms: u64,
    ) -> Self {
        Self::ToolCompleted {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            tool_call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_error(
        ctx: &ExecutionContext,
        call_id: &ToolCallId,
        tool_name: &str,
        error: String,
    ) -> Self {
        Self::ToolError {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            tool_call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn agent_completed(ctx: &ExecutionContext, result: serde_json::Value) -> Self {
        Self::AgentCompleted {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            result,
            timestamp: Utc::now(),
        }
    }

    pub fn agent_failed(ctx: &ExecutionContext, reason: String) -> Self {
        Self::AgentFailed {
            user_id: ctx.user_id.clone(),
            run_id: ctx.run_id.clone(),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            Self::AgentStarted { user_id, .. }
            | Self::AgentThinking { user_id, .. }
            | Self::ToolExecuting { user_id, .. }
            | Self::ToolCompleted { user_id, .. }
            | Self::ToolError { user_id, .. }
            | Self::AgentCompleted { user_id, .. }
            | Self::AgentFailed { user_id, .. } => user_id,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::AgentStarted { run_id, .. }
            | Self::AgentThinking { run_id, .. }
            | Self::ToolExecuting { run_id, .. }
            | Self::ToolCompleted { run_id, .. }
            | Self::ToolError { run_id, .. }
            | Self::AgentCompleted { run_id, .. }
            | Self::AgentFailed { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentThinking { .. } => "agent_thinking",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ToolError { .. } => "tool_error",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::AgentFailed { .. } => "agent_failed",
        }
    }

    /// Terminal events end a run; nothing for the same run_id may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentCompleted { .. } | Self::AgentFailed { .. })
    }
}
