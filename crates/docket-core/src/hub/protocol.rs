//! Inbound protocol dispatch for one real-time connection.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{ConnectionSink, NotificationHub};
use crate::domain::{ClientEvent, ServerEvent, SessionId};

/// Idle window after which a monitoring channel sends a `ping` heartbeat.
pub const HEARTBEAT_IDLE: Duration = Duration::from_secs(30);

/// Parse and dispatch one inbound frame.
///
/// Protocol errors (malformed payload, unknown type) go back to the offending
/// connection only, as an `error` event; the connection stays open.
pub async fn handle_client_event(
    hub: &NotificationHub,
    sink: &Arc<dyn ConnectionSink>,
    session_id: &SessionId,
    raw: &str,
) {
    let event: ClientEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection = %sink.id(), error = %e, "protocol error");
            let _ = sink
                .send(ServerEvent::Error {
                    message: format!("invalid message: {e}"),
                })
                .await;
            return;
        }
    };

    let Some(user_id) = hub.user_of(sink.id()).await else {
        let _ = sink
            .send(ServerEvent::Error {
                message: "connection is not joined to a session".into(),
            })
            .await;
        return;
    };

    match event {
        ClientEvent::Typing { is_typing } => {
            hub.typing(session_id, user_id, is_typing).await;
        }
        ClientEvent::ChatMessage { text } => {
            hub.broadcast(
                session_id,
                ServerEvent::UserMessage { user_id, text },
                None,
            )
            .await;
        }
        ClientEvent::JurisdictionUpdate { jurisdiction } => {
            // Fan the change out to everyone else in the session.
            hub.broadcast(
                session_id,
                ServerEvent::JurisdictionUpdate {
                    user_id,
                    jurisdiction,
                },
                Some(sink.id()),
            )
            .await;
        }
        ClientEvent::RequestContext => {
            let users = hub.get_session_users(session_id).await;
            let typing_users = hub.get_typing_users(session_id).await;
            let _ = sink
                .send(ServerEvent::SessionContext {
                    users,
                    typing_users,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionId, UserId};
    use crate::error::DocketError;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct FakeConn {
        id: ConnectionId,
        received: Mutex<Vec<ServerEvent>>,
    }

    impl FakeConn {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::generate(),
                received: Mutex::new(Vec::new()),
            })
        }

        async fn events(&self) -> Vec<ServerEvent> {
            self.received.lock().await.clone()
        }
    }

    #[async_trait]
    impl ConnectionSink for FakeConn {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, event: ServerEvent) -> Result<(), DocketError> {
            self.received.lock().await.push(event);
            Ok(())
        }
    }

    fn as_sink(conn: &Arc<FakeConn>) -> Arc<dyn ConnectionSink> {
        Arc::clone(conn) as Arc<dyn ConnectionSink>
    }

    #[tokio::test]
    async fn malformed_frame_errors_only_the_offender() {
        let hub = NotificationHub::new(Duration::from_millis(200));
        let s1 = SessionId::new("s1");
        let c1 = FakeConn::new();
        let c2 = FakeConn::new();
        hub.join(as_sink(&c1), s1.clone(), UserId::new("u1")).await;
        hub.join(as_sink(&c2), s1.clone(), UserId::new("u2")).await;

        let before = c2.events().await.len();
        handle_client_event(&hub, &as_sink(&c1), &s1, "{not json").await;

        assert!(c1
            .events()
            .await
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { .. })));
        // The rest of the session heard nothing, and nobody got kicked.
        assert_eq!(c2.events().await.len(), before);
        assert_eq!(hub.get_session_users(&s1).await.len(), 2);
    }

    #[tokio::test]
    async fn chat_message_is_fanned_out() {
        let hub = NotificationHub::new(Duration::from_millis(200));
        let s1 = SessionId::new("s1");
        let c1 = FakeConn::new();
        let c2 = FakeConn::new();
        hub.join(as_sink(&c1), s1.clone(), UserId::new("u1")).await;
        hub.join(as_sink(&c2), s1.clone(), UserId::new("u2")).await;

        let raw = r#"{"type":"chat_message","payload":{"text":"does clause 4 apply?"}}"#;
        handle_client_event(&hub, &as_sink(&c1), &s1, raw).await;

        assert!(c2.events().await.contains(&ServerEvent::UserMessage {
            user_id: UserId::new("u1"),
            text: "does clause 4 apply?".into(),
        }));
    }

    #[tokio::test]
    async fn request_context_replies_with_members_and_typing() {
        let hub = NotificationHub::new(Duration::from_millis(200));
        let s1 = SessionId::new("s1");
        let c1 = FakeConn::new();
        let c2 = FakeConn::new();
        hub.join(as_sink(&c1), s1.clone(), UserId::new("u1")).await;
        hub.join(as_sink(&c2), s1.clone(), UserId::new("u2")).await;
        hub.typing(&s1, UserId::new("u2"), true).await;

        handle_client_event(&hub, &as_sink(&c1), &s1, r#"{"type":"request_context"}"#).await;

        let got = c1.events().await;
        let ctx = got
            .iter()
            .find_map(|e| match e {
                ServerEvent::SessionContext {
                    users,
                    typing_users,
                } => Some((users.clone(), typing_users.clone())),
                _ => None,
            })
            .expect("session_context reply");
        assert_eq!(ctx.0, vec![UserId::new("u1"), UserId::new("u2")]);
        assert_eq!(ctx.1, vec![UserId::new("u2")]);
    }

    #[tokio::test]
    async fn typing_frame_flips_typing_state() {
        let hub = NotificationHub::new(Duration::from_millis(200));
        let s1 = SessionId::new("s1");
        let c1 = FakeConn::new();
        hub.join(as_sink(&c1), s1.clone(), UserId::new("u1")).await;

        let raw = r#"{"type":"typing","payload":{"is_typing":true}}"#;
        handle_client_event(&hub, &as_sink(&c1), &s1, raw).await;
        assert_eq!(hub.get_typing_users(&s1).await, vec![UserId::new("u1")]);
    }
}
