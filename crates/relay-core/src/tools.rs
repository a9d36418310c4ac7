use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{RunId, UserId};

/// Context handed to a tool capability for one invocation. Carries only the
/// owning run's identity; nothing here is shared across users.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub user_id: UserId,
    pub run_id: RunId,
    pub agent_context: HashMap<String, serde_json::Value>,
    pub abort_signal: CancellationToken,
}

/// Outcome of one tool invocation. Produced exactly once per invocation and
/// immutable after creation; `user_context` records which user's context the
/// result was computed under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub user_context: UserId,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolExecutionResult {
    pub fn ok(user: &UserId, result: serde_json::Value, duration: Duration) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_message: None,
            user_context: user.clone(),
            duration,
        }
    }

    pub fn err(user: &UserId, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error_message: Some(message.into()),
            user_context: user.clone(),
            duration,
        }
    }
}

/// An opaque tool capability. Implementations are external collaborators;
/// the engine only sees this interface.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON-schema-shaped parameter description. The dispatcher enforces the
    /// top-level `required` list before invoking the capability.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Permission names the calling context must hold. Empty means public.
    fn required_permissions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        parameters: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("permission denied for tool {tool}: missing {missing}")]
    PermissionDenied { tool: String, missing: String },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("dispatcher scope already released")]
    Released,
}

impl ToolError {
    /// Dispatch-level errors are reported to the caller as typed errors;
    /// everything else is folded into a failed `ToolExecutionResult`.
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::PermissionDenied { .. }
                | Self::InvalidParameters(_)
                | Self::Released
        )
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_constructors() {
        let user = UserId::from_raw("alice");
        let ok = ToolExecutionResult::ok(&user, serde_json::json!(7), Duration::from_millis(3));
        assert!(ok.success);
        assert_eq!(ok.result, Some(serde_json::json!(7)));
        assert!(ok.error_message.is_none());
        assert_eq!(ok.user_context, user);

        let err = ToolExecutionResult::err(&user, "boom", Duration::ZERO);
        assert!(!err.success);
        assert!(err.result.is_none());
        assert_eq!(err.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn duration_serializes_as_ms() {
        let user = UserId::from_raw("alice");
        let r = ToolExecutionResult::ok(&user, serde_json::Value::Null, Duration::from_millis(250));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["duration"], 250);
        let parsed: ToolExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(250));
    }

    #[test]
    fn dispatch_error_classification() {
        assert!(ToolError::NotFound("x".into()).is_dispatch_error());
        assert!(ToolError::PermissionDenied {
            tool: "x".into(),
            missing: "admin".into()
        }
        .is_dispatch_error());
        assert!(ToolError::InvalidParameters("missing field".into()).is_dispatch_error());
        assert!(ToolError::Released.is_dispatch_error());
        assert!(!ToolError::ExecutionFailed("boom".into()).is_dispatch_error());
        assert!(!ToolError::Timeout(Duration::from_secs(5)).is_dispatch_error());
        assert!(!ToolError::Cancelled.is_dispatch_error());
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::PermissionDenied {
            tool: "search".into(),
            missing: "web".into(),
        };
        assert_eq!(err.to_string(), "permission denied for tool search: missing web");
    }
}
