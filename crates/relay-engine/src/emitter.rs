use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use relay_core::events::RunEvent;
use relay_core::ids::UserId;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("event for user {got} rejected by emitter bound to {expected}")]
    UserMismatch { expected: UserId, got: UserId },
    #[error("receiver dropped, channel closed")]
    Closed,
}

/// One user's delivery channel. Bounded mpsc: emission suspends when the
/// consumer lags, so a slow client backpressures its own runs and nobody
/// else's.
///
/// The emitter refuses events carrying a different user's id. Delivery
/// wiring cannot leak events across users even if a caller passes the wrong
/// emitter.
pub struct EventEmitter {
    user_id: UserId,
    tx: mpsc::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create an emitter and its receiving half.
    pub fn channel(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { user_id, tx }), rx)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Send one event in FIFO order. Awaits channel capacity.
    pub async fn emit(&self, event: RunEvent) -> Result<(), EmitError> {
        if event.user_id() != &self.user_id {
            warn!(
                expected = %self.user_id,
                got = %event.user_id(),
                event_type = event.event_type(),
                "cross-user event rejected"
            );
            return Err(EmitError::UserMismatch {
                expected: self.user_id.clone(),
                got: event.user_id().clone(),
            });
        }
        self.tx.send(event).await.map_err(|_| EmitError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::context::ExecutionContext;
    use relay_core::ids::ThreadId;

    fn ctx_for(user: &str) -> ExecutionContext {
        ExecutionContext::new(UserId::from_raw(user), ThreadId::new())
    }

    #[tokio::test]
    async fn events_delivered_in_order() {
        let (emitter, mut rx) = EventEmitter::channel(UserId::from_raw("alice"), 16);
        let ctx = ctx_for("alice");

        emitter.emit(RunEvent::agent_started(&ctx, "planner")).await.unwrap();
        emitter
            .emit(RunEvent::agent_thinking(&ctx, 0, "first".into()))
            .await
            .unwrap();
        emitter
            .emit(RunEvent::agent_completed(&ctx, serde_json::Value::Null))
            .await
            .unwrap();
        drop(emitter);

        let mut types = Vec::new();
        while let Some(event) = rx.recv().await {
            types.push(event.event_type());
        }
        assert_eq!(types, vec!["agent_started", "agent_thinking", "agent_completed"]);
    }

    #[tokio::test]
    async fn cross_user_event_rejected() {
        let (emitter, mut rx) = EventEmitter::channel(UserId::from_raw("alice"), 16);
        let mallory = ctx_for("mallory");

        let err = emitter
            .emit(RunEvent::agent_started(&mallory, "planner"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmitError::UserMismatch { .. }));

        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_channel_reported() {
        let (emitter, rx) = EventEmitter::channel(UserId::from_raw("alice"), 16);
        drop(rx);
        let ctx = ctx_for("alice");

        assert!(emitter.is_closed());
        let err = emitter
            .emit(RunEvent::agent_started(&ctx, "planner"))
            .await
            .unwrap_err();
        assert_eq!(err, EmitError::Closed);
    }

    #[tokio::test]
    async fn full_channel_backpressures_until_drained() {
        let (emitter, mut rx) = EventEmitter::channel(UserId::from_raw("alice"), 1);
        let ctx = ctx_for("alice");

        emitter
            .emit(RunEvent::agent_thinking(&ctx, 0, "a".into()))
            .await
            .unwrap();

        // Second emit must suspend until the consumer drains one slot
        let pending = {
            let emitter = Arc::clone(&emitter);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                emitter
                    .emit(RunEvent::agent_thinking(&ctx, 1, "b".into()))
                    .await
            })
        };

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await.unwrap().event_type(), "agent_thinking");
        pending.await.unwrap().unwrap();
        match rx.recv().await.unwrap() {
            RunEvent::AgentThinking { sequence, .. } => assert_eq!(sequence, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
