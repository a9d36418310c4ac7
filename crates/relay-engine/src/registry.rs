use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use relay_core::agent::{Agent, AgentFactory};
use relay_core::ids::{RunId, UserId};

use crate::emitter::EventEmitter;

/// One user's isolated slice of the engine: their agent instances, their
/// delivery channel, and the cancellation tokens of their in-flight runs.
pub struct Session {
    user_id: UserId,
    agents: DashMap<String, Arc<dyn Agent>>,
    emitter: RwLock<Weak<EventEmitter>>,
    active_runs: DashMap<RunId, CancellationToken>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            agents: DashMap::new(),
            emitter: RwLock::new(Weak::new()),
            active_runs: DashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve an agent by name: session instances first, then the
    /// process-wide factory catalog (instantiating into the session lazily).
    pub fn resolve_agent(
        &self,
        name: &str,
        factories: &DashMap<String, Arc<dyn AgentFactory>>,
    ) -> Option<Arc<dyn Agent>> {
        if let Some(agent) = self.agents.get(name) {
            return Some(Arc::clone(&agent));
        }
        let factory = factories.get(name)?;
        let agent = factory.create();
        debug!(user_id = %self.user_id, agent = name, "agent instantiated from catalog");
        self.agents.insert(name.to_string(), Arc::clone(&agent));
        Some(agent)
    }

    /// Bind the delivery channel. Rebinding on reconnect replaces the old
    /// weak reference; runs pick up the new emitter on their next emit.
    pub fn bind_emitter(&self, emitter: &Arc<EventEmitter>) {
        *self.emitter.write() = Arc::downgrade(emitter);
    }

    /// The currently bound emitter, if a consumer is still attached.
    pub fn emitter(&self) -> Option<Arc<EventEmitter>> {
        self.emitter.read().upgrade()
    }

    /// Claim a run slot and hand back its cancellation token.
    pub fn begin_run(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.active_runs.insert(run_id.clone(), token.clone());
        token
    }

    /// Release a run slot. Idempotent.
    pub fn end_run(&self, run_id: &RunId) {
        self.active_runs.remove(run_id);
    }

    /// Signal cooperative cancellation. Returns false for unknown/finished
    /// runs.
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        match self.active_runs.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.len()
    }

    fn cancel_all_runs(&self) -> usize {
        let mut n = 0;
        for entry in self.active_runs.iter() {
            entry.value().cancel();
            n += 1;
        }
        n
    }
}

/// Registry-level counters snapshot. Computed from atomics only, so health
/// probes never contend with run traffic on the session map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryHealth {
    pub active_sessions: u64,
    pub total_sessions_created: u64,
    pub active_runs: u64,
    pub total_runs_started: u64,
}

/// Process-wide map of user sessions plus the agent factory catalog.
pub struct AgentRegistry {
    sessions: DashMap<UserId, Arc<Session>>,
    factories: DashMap<String, Arc<dyn AgentFactory>>,
    sessions_created: AtomicU64,
    sessions_removed: AtomicU64,
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            factories: DashMap::new(),
            sessions_created: AtomicU64::new(0),
            sessions_removed: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
        }
    }

    /// Register a factory in the process-wide catalog. Any session can then
    /// resolve the agent without a prior `register_agent` call.
    pub fn register_factory(&self, factory: Arc<dyn AgentFactory>) {
        self.factories
            .insert(factory.agent_name().to_string(), factory);
    }

    pub fn factories(&self) -> &DashMap<String, Arc<dyn AgentFactory>> {
        &self.factories
    }

    /// Idempotent session lookup-or-create. Concurrent callers for the same
    /// user get the same `Arc<Session>`; the entry API holds the shard lock
    /// across the check-then-insert.
    pub fn get_or_create_session(&self, user_id: &UserId) -> Arc<Session> {
        if let Some(session) = self.sessions.get(user_id) {
            return Arc::clone(&session);
        }
        let entry = self
            .sessions
            .entry(user_id.clone())
            .or_insert_with(|| {
                self.sessions_created.fetch_add(1, Ordering::Relaxed);
                info!(user_id = %user_id, "session created");
                Arc::new(Session::new(user_id.clone()))
            });
        Arc::clone(&entry)
    }

    pub fn get_session(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|s| Arc::clone(&s))
    }

    /// Tear down a user's session: cancel outstanding runs, drop the session.
    /// Returns false if the user had no session.
    pub fn cleanup(&self, user_id: &UserId) -> bool {
        match self.sessions.remove(user_id) {
            Some((_, session)) => {
                let cancelled = session.cancel_all_runs();
                self.sessions_removed.fetch_add(1, Ordering::Relaxed);
                info!(user_id = %user_id, cancelled_runs = cancelled, "session removed");
                true
            }
            None => false,
        }
    }

    pub(crate) fn note_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_run_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Lock-free health snapshot.
    pub fn get_registry_health(&self) -> RegistryHealth {
        let created = self.sessions_created.load(Ordering::Relaxed);
        let removed = self.sessions_removed.load(Ordering::Relaxed);
        let started = self.runs_started.load(Ordering::Relaxed);
        let finished = self.runs_finished.load(Ordering::Relaxed);
        RegistryHealth {
            active_sessions: created.saturating_sub(removed),
            total_sessions_created: created,
            active_runs: started.saturating_sub(finished),
            total_runs_started: started,
        }
    }
}
