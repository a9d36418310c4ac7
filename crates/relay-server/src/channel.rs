use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use relay_core::events::RunEvent;
use relay_core::ids::UserId;
use relay_engine::{EventEmitter, ExecutionEngine};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live WebSocket connection. Holds the `Arc<EventEmitter>` keeping the
/// session's weak delivery binding alive; dropping the connection releases
/// the emitter and the engine starts logging dropped events for that user.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    emitter: Arc<EventEmitter>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, user_id: UserId, emitter: Arc<EventEmitter>) -> Self {
        Self {
            id,
            user_id,
            emitter,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CONNECTION_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of live WebSocket connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    channel_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            channel_capacity,
        }
    }

    /// Register a connection for a user: create a fresh emitter, bind it to
    /// the user's session (rebind-on-reconnect), and hand back the receiving
    /// half for forwarding to the socket.
    pub fn register(
        &self,
        engine: &ExecutionEngine,
        user_id: UserId,
    ) -> (ConnectionId, mpsc::Receiver<RunEvent>) {
        let (emitter, rx) = EventEmitter::channel(user_id.clone(), self.channel_capacity);
        let session = engine.registry().get_or_create_session(&user_id);
        session.bind_emitter(&emitter);

        let id = ConnectionId::new();
        let connection = Arc::new(Connection::new(id.clone(), user_id, emitter));
        self.connections.insert(id.clone(), connection);
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections_for_user(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| &e.user_id == user_id)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Remove connections that stopped answering pings.
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|e| !e.is_alive())
            .map(|e| e.id.clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        removed
    }
}

/// Drive one WebSocket connection: forward the user's event channel to the
/// socket, ping on an interval, track pongs for liveness.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut events: mpsc::Receiver<RunEvent>,
    registry: Arc<ConnectionRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: event channel → socket, plus heartbeat pings
    let writer_id = connection_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            let text = match serde_json::to_string(&event) {
                                Ok(text) => text,
                                Err(e) => {
                                    tracing::error!(error = %e, "event serialization failed");
                                    continue;
                                }
                            };
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(connection) = writer_registry.connections.get(&writer_id) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    });

    // Reader: track pongs, notice close
    let reader_id = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Pong(_) => {
                    if let Some(connection) = reader_registry.connections.get(&reader_id) {
                        connection.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&connection_id);
}

/// Periodic dead-connection sweep.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections();
            if removed > 0 {
                tracing::info!(removed = removed, "dead connection cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_engine::{AgentRegistry, EngineConfig, ExecutionTracker};

    fn engine() -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine::new(
            EngineConfig::default(),
            Arc::new(ExecutionTracker::new()),
            Arc::new(AgentRegistry::new()),
            Vec::new(),
        ))
    }

    #[test]
    fn connection_id_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("conn_"));
    }

    #[tokio::test]
    async fn register_binds_session_emitter() {
        let engine = engine();
        let registry = ConnectionRegistry::new(32);
        let user = UserId::from_raw("alice");

        let (id, _rx) = registry.register(&engine, user.clone());
        assert_eq!(registry.count(), 1);

        let session = engine.registry().get_session(&user).unwrap();
        assert!(session.emitter().is_some());

        registry.unregister(&id);
        assert_eq!(registry.count(), 0);
        // Connection (and its emitter) dropped, so the weak binding is dead
        assert!(session.emitter().is_none());
    }

    #[tokio::test]
    async fn reconnect_rebinds_to_newest_emitter() {
        let engine = engine();
        let registry = ConnectionRegistry::new(32);
        let user = UserId::from_raw("alice");

        let (first, _rx1) = registry.register(&engine, user.clone());
        let (_second, mut rx2) = registry.register(&engine, user.clone());

        // Events flow to the newest connection's channel
        let session = engine.registry().get_session(&user).unwrap();
        let emitter = session.emitter().unwrap();
        let ctx = relay_core::context::ExecutionContext::new(
            user.clone(),
            relay_core::ids::ThreadId::new(),
        );
        emitter
            .emit(RunEvent::agent_started(&ctx, "planner"))
            .await
            .unwrap();
        assert_eq!(rx2.recv().await.unwrap().event_type(), "agent_started");

        registry.unregister(&first);
        assert_eq!(registry.connections_for_user(&user).len(), 1);
    }

    #[tokio::test]
    async fn dead_connections_swept() {
        let engine = engine();
        let registry = ConnectionRegistry::new(32);
        let (id, _rx) = registry.register(&engine, UserId::from_raw("alice"));

        registry
            .connections
            .get(&id)
            .unwrap()
            .last_pong
            .store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_connections(), 1);
        assert_eq!(registry.count(), 0);
    }
}
