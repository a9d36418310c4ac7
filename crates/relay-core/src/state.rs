use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, UserId};

/// Run lifecycle status. Transitions are monotonic: once a run reaches
/// `Completed` or `Failed` it never leaves that state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Initialized | Self::Running)
    }

    /// The only legal edges: INITIALIZED → RUNNING → {COMPLETED | FAILED}.
    /// INITIALIZED → FAILED covers runs that die before their drive task
    /// reaches RUNNING (e.g. the host task is killed first).
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initialized, Self::Running)
                | (Self::Initialized, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

/// One record per run_id in the execution tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub user_id: UserId,
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
}

impl ExecutionState {
    pub fn new(user_id: UserId, run_id: RunId) -> Self {
        Self {
            user_id,
            run_id,
            status: RunStatus::Initialized,
            created_at: Utc::now(),
            completed_at: None,
            result_data: None,
            failure_reason: None,
        }
    }
}
