use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, RunId, ThreadId, UserId};

/// Immutable per-request isolation token.
///
/// One context is created at request entry, handed to exactly one
/// `ExecutionEngine::start_run` invocation, and discarded after the run
/// finalizes. The permission set rides on the context because the scoped
/// tool dispatcher checks it on every invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub user_id: UserId,
    pub thread_id: ThreadId,
    pub run_id: RunId,
    pub request_id: RequestId,
    pub agent_context: HashMap<String, serde_json::Value>,
    pub permissions: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("missing required identifier: {0}")]
    MissingIdentifier(&'static str),
}

impl ExecutionContext {
    /// Build a context for a new run. `run_id` and `request_id` are generated.
    pub fn new(user_id: UserId, thread_id: ThreadId) -> Self {
        Self {
            user_id,
            thread_id,
            run_id: RunId::new(),
            request_id: RequestId::new(),
            agent_context: HashMap::new(),
            permissions: HashSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agent_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.agent_context.insert(key.into(), value);
        self
    }

    /// Reject contexts with empty identifiers. Called by the engine before
    /// any state mutation, so a bad context never registers a run.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.user_id.is_empty() {
            return Err(ContextError::MissingIdentifier("user_id"));
        }
        if self.thread_id.is_empty() {
            return Err(ContextError::MissingIdentifier("thread_id"));
        }
        if self.run_id.is_empty() {
            return Err(ContextError::MissingIdentifier("run_id"));
        }
        if self.request_id.is_empty() {
            return Err(ContextError::MissingIdentifier("request_id"));
        }
        Ok(())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}
