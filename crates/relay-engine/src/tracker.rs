use dashmap::DashMap;
use tracing::warn;

use relay_core::ids::{RunId, UserId};
use relay_core::state::{ExecutionState, RunStatus};

use crate::error::EngineError;

const DEFAULT_TERMINAL_HISTORY: usize = 1024;

/// Concurrency-safe record of every run the engine knows about.
///
/// All status mutations go through [`transition`], which holds the entry's
/// shard lock across the compare-and-set, so two finalizers racing the same
/// run can never both win. Terminal records are kept for inspection in a
/// bounded history window and pruned oldest-first.
pub struct ExecutionTracker {
    executions: DashMap<(UserId, RunId), ExecutionState>,
    terminal_history: usize,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::with_terminal_history(DEFAULT_TERMINAL_HISTORY)
    }

    pub fn with_terminal_history(terminal_history: usize) -> Self {
        Self {
            executions: DashMap::new(),
            terminal_history,
        }
    }

    /// Register a new run as INITIALIZED. Rejects run_id reuse.
    pub fn register(&self, user_id: &UserId, run_id: &RunId) -> Result<(), EngineError> {
        let key = (user_id.clone(), run_id.clone());
        match self.executions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::DuplicateRun(run_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ExecutionState::new(user_id.clone(), run_id.clone()));
                Ok(())
            }
        }
    }

    /// Compare-and-set status transition. The mutation closure only runs if
    /// the edge is legal; illegal edges (including any transition out of a
    /// terminal state) return a typed error and leave the record untouched.
    fn transition<F>(
        &self,
        user_id: &UserId,
        run_id: &RunId,
        next: RunStatus,
        mutate: F,
    ) -> Result<ExecutionState, EngineError>
    where
        F: FnOnce(&mut ExecutionState),
    {
        let key = (user_id.clone(), run_id.clone());
        let mut entry = self
            .executions
            .get_mut(&key)
            .ok_or_else(|| EngineError::Internal(format!("unknown run: {run_id}")))?;

        if !entry.status.can_transition_to(next) {
            return Err(EngineError::TerminalState {
                run_id: run_id.clone(),
                status: entry.status,
            });
        }

        entry.status = next;
        mutate(&mut entry);
        Ok(entry.clone())
    }

    pub fn mark_running(&self, user_id: &UserId, run_id: &RunId) -> Result<(), EngineError> {
        self.transition(user_id, run_id, RunStatus::Running, |_| {})?;
        Ok(())
    }

    /// Finalize as COMPLETED with the agent's result. Loses the race if the
    /// run is already terminal.
    pub fn complete(
        &self,
        user_id: &UserId,
        run_id: &RunId,
        result_data: serde_json::Value,
    ) -> Result<ExecutionState, EngineError> {
        let state = self.transition(user_id, run_id, RunStatus::Completed, |s| {
            s.completed_at = Some(chrono::Utc::now());
            s.result_data = Some(result_data);
        })?;
        self.prune_terminal();
        Ok(state)
    }

    /// Finalize as FAILED with a stable reason string.
    pub fn fail(
        &self,
        user_id: &UserId,
        run_id: &RunId,
        reason: impl Into<String>,
    ) -> Result<ExecutionState, EngineError> {
        let state = self.transition(user_id, run_id, RunStatus::Failed, |s| {
            s.completed_at = Some(chrono::Utc::now());
            s.failure_reason = Some(reason.into());
        })?;
        self.prune_terminal();
        Ok(state)
    }

    /// Read-only snapshot of one run. Safe to call repeatedly; never mutates.
    pub fn get_execution_state(&self, user_id: &UserId, run_id: &RunId) -> Option<ExecutionState> {
        self.executions
            .get(&(user_id.clone(), run_id.clone()))
            .map(|e| e.clone())
    }

    /// Snapshot of all non-terminal runs.
    pub fn get_active_executions(&self) -> Vec<ExecutionState> {
        self.executions
            .iter()
            .filter(|e| e.status.is_active())
            .map(|e| e.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.executions
            .iter()
            .filter(|e| e.status.is_active())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.executions.len()
    }

    /// Admin/test reset. Drops every record, active ones included.
    pub fn clear_all_executions(&self) -> usize {
        let n = self.executions.len();
        if self.executions.iter().any(|e| e.status.is_active()) {
            warn!("clearing tracker with active executions present");
        }
        self.executions.clear();
        n
    }

    /// Drop the oldest terminal records once the history window is exceeded.
    fn prune_terminal(&self) {
        let mut terminal: Vec<((UserId, RunId), chrono::DateTime<chrono::Utc>)> = self
            .executions
            .iter()
            .filter(|e| e.status.is_terminal())
            .map(|e| (e.key().clone(), e.completed_at.unwrap_or(e.created_at)))
            .collect();

        if terminal.len() <= self.terminal_history {
            return;
        }

        terminal.sort_by_key(|(_, at)| *at);
        let excess = terminal.len() - self.terminal_history;
        for (key, _) in terminal.into_iter().take(excess) {
            self.executions.remove(&key);
        }
    }
}
