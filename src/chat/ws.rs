use axum::{
    debug_handler,
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tower_sessions::Session;
use uuid::Uuid;

use crate::error::ChatError;
use crate::room::resolve_room;
use crate::session::USER_ID;

use super::event::{ClientEvent, ServerEvent};
use super::registry::{SessionId, SessionRegistry};
use super::store::ConversationStore;

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    State(store): State<ConversationStore>,
    State(registry): State<SessionRegistry>,
    session: Session,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_id = session.get::<String>(USER_ID).await.ok().flatten();

    ws.on_upgrade(async move |stream| {
        handle_socket(stream, store, registry, user_id).await;
    })
}

async fn handle_socket(
    stream: WebSocket,
    store: ConversationStore,
    registry: SessionRegistry,
    user_id: Option<String>,
) {
    let (mut sender, mut receiver) = stream.split();

    // identity comes from the auth service at connection time; without it
    // we report once and refuse chat events entirely
    let Some(user_id) = user_id else {
        let refusal = ServerEvent::Error {
            message: "authentication required".into(),
        };
        if let Ok(text) = serde_json::to_string(&refusal) {
            let _ = sender.send(text.into()).await;
        }
        let _ = sender.close().await;
        return;
    };

    let session_id = Uuid::now_v7();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let outbound_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(text.into()).await.is_err() {
                break;
            }
        }
    });

    // one event at a time per connection, so a sender's messages reach
    // the room in the order they were sent
    while let Some(Ok(frame)) = receiver.next().await {
        let Ok(event) = serde_json::from_slice::<ClientEvent>(&frame.into_data()) else {
            continue;
        };

        if let Err(err) = handle_event(&store, &registry, &tx, session_id, &user_id, event).await {
            tracing::warn!(%session_id, error = %err, "chat event failed");
            let _ = tx.send(ServerEvent::Error {
                message: err.to_string(),
            });
        }
    }

    registry.disconnect(session_id);
    outbound_task.abort();
}

/// One inbound event, handled to completion. Failures are returned to be
/// reported to this session only; they never touch other members and a
/// failed send broadcasts nothing.
async fn handle_event(
    store: &ConversationStore,
    registry: &SessionRegistry,
    tx: &UnboundedSender<ServerEvent>,
    session_id: SessionId,
    user_id: &str,
    event: ClientEvent,
) -> Result<(), ChatError> {
    match event {
        ClientEvent::Join {
            sender_id,
            receiver_id,
        } => {
            check_payload(user_id, &sender_id, &receiver_id)?;

            let room = resolve_room(&sender_id, &receiver_id);
            registry.join(room, session_id, tx.clone());
            Ok(())
        }

        ClientEvent::SendMessage {
            sender_id,
            receiver_id,
            message,
        } => {
            check_payload(user_id, &sender_id, &receiver_id)?;
            if message.is_empty() {
                return Err(ChatError::Validation("message body is empty".into()));
            }

            let room = resolve_room(&sender_id, &receiver_id);
            let conversation = store.find_or_create(&sender_id, &receiver_id).await?;
            let stored = store
                .append_message(&conversation.id, &sender_id, &message)
                .await?;
            let sender = store.sender_profile(&sender_id).await?;

            // broadcast only after persistence succeeded; the sender gets
            // its own echo carrying the server-assigned id and timestamp
            let delivered =
                registry.broadcast(&room, &ServerEvent::MessageReceived(stored.enriched(sender)));
            tracing::debug!(room = %room, delivered, "message broadcast");
            Ok(())
        }
    }
}

fn check_payload(user_id: &str, sender_id: &str, receiver_id: &str) -> Result<(), ChatError> {
    if sender_id.is_empty() || receiver_id.is_empty() {
        return Err(ChatError::Validation("participant id is empty".into()));
    }
    if sender_id == receiver_id {
        return Err(ChatError::Validation(
            "sender and receiver must differ".into(),
        ));
    }
    // the connection may only speak as the identity it authenticated with
    if sender_id != user_id {
        return Err(ChatError::Authentication);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::event::ChatMessage;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct TestSession {
        id: SessionId,
        tx: UnboundedSender<ServerEvent>,
        rx: UnboundedReceiver<ServerEvent>,
    }

    fn test_session() -> TestSession {
        let (tx, rx) = mpsc::unbounded_channel();
        TestSession {
            id: Uuid::now_v7(),
            tx,
            rx,
        }
    }

    async fn test_store() -> ConversationStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init(&pool).await.unwrap();
        ConversationStore::new(pool)
    }

    async fn join(
        store: &ConversationStore,
        registry: &SessionRegistry,
        session: &TestSession,
        me: &str,
        peer: &str,
    ) {
        handle_event(
            store,
            registry,
            &session.tx,
            session.id,
            me,
            ClientEvent::Join {
                sender_id: me.into(),
                receiver_id: peer.into(),
            },
        )
        .await
        .unwrap();
    }

    async fn send(
        store: &ConversationStore,
        registry: &SessionRegistry,
        session: &TestSession,
        me: &str,
        peer: &str,
        body: &str,
    ) -> Result<(), ChatError> {
        handle_event(
            store,
            registry,
            &session.tx,
            session.id,
            me,
            ClientEvent::SendMessage {
                sender_id: me.into(),
                receiver_id: peer.into(),
                message: body.into(),
            },
        )
        .await
    }

    fn expect_message(session: &mut TestSession) -> ChatMessage {
        match session.rx.try_recv() {
            Ok(ServerEvent::MessageReceived(msg)) => msg,
            other => panic!("expected messageReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_members_and_the_sender_receive_the_echo() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let mut u1 = test_session();
        let mut u2 = test_session();

        join(&store, &registry, &u1, "U1", "U2").await;
        join(&store, &registry, &u2, "U2", "U1").await;

        send(&store, &registry, &u1, "U1", "U2", "hello")
            .await
            .unwrap();

        let got1 = expect_message(&mut u1);
        let got2 = expect_message(&mut u2);
        assert_eq!(got1.message, "hello");
        assert_eq!(got1.sender.id, "U1");
        assert_eq!(got2.message, "hello");
        // the echo carries the server-assigned id, same on both ends
        assert!(!got1.id.is_empty());
        assert_eq!(got1.id, got2.id);
    }

    #[tokio::test]
    async fn send_before_the_peer_joins_still_persists() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let u2 = test_session();

        join(&store, &registry, &u2, "U2", "U1").await;
        send(&store, &registry, &u2, "U2", "U1", "hi").await.unwrap();

        let history = store
            .conversation_for_pair("U1", "U2", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].message, "hi");
        assert_eq!(history.messages[0].sender.id, "U2");
    }

    #[tokio::test]
    async fn messages_stay_inside_their_room() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let mut ab = test_session();
        let mut ac = test_session();

        join(&store, &registry, &ab, "A", "B").await;
        join(&store, &registry, &ac, "C", "A").await;

        send(&store, &registry, &ab, "A", "B", "for b only")
            .await
            .unwrap();

        assert_eq!(expect_message(&mut ab).message, "for b only");
        assert!(ac.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejoining_does_not_duplicate_delivery() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let mut u1 = test_session();

        join(&store, &registry, &u1, "U1", "U2").await;
        join(&store, &registry, &u1, "U1", "U2").await;

        send(&store, &registry, &u1, "U1", "U2", "once").await.unwrap();

        expect_message(&mut u1);
        assert!(u1.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spoofed_sender_is_refused() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let mut u1 = test_session();

        join(&store, &registry, &u1, "U1", "U2").await;

        let result = handle_event(
            &store,
            &registry,
            &u1.tx,
            u1.id,
            "U1",
            ClientEvent::SendMessage {
                sender_id: "U9".into(),
                receiver_id: "U2".into(),
                message: "as someone else".into(),
            },
        )
        .await;

        assert!(matches!(result, Err(ChatError::Authentication)));
        assert!(u1.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_any_state_change() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let mut u1 = test_session();

        join(&store, &registry, &u1, "U1", "U2").await;

        let result = send(&store, &registry, &u1, "U1", "U2", "").await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert!(u1.rx.try_recv().is_err());

        // no conversation was created as a side effect
        assert!(store
            .conversation_for_pair("U1", "U2", false)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failed_persistence_broadcasts_nothing_and_spares_other_rooms() {
        let broken = test_store().await;
        let registry = SessionRegistry::new();
        let mut u1 = test_session();
        let mut u2 = test_session();

        join(&broken, &registry, &u1, "U1", "U2").await;
        join(&broken, &registry, &u2, "U2", "U1").await;

        broken.pool.close().await;

        let result = send(&broken, &registry, &u1, "U1", "U2", "lost").await;
        assert!(matches!(result, Err(ChatError::Persistence(_))));
        assert!(u1.rx.try_recv().is_err());
        assert!(u2.rx.try_recv().is_err());

        // an independent send through a healthy store in another room
        // still goes through
        let healthy = test_store().await;
        let mut u3 = test_session();
        join(&healthy, &registry, &u3, "U3", "U4").await;
        send(&healthy, &registry, &u3, "U3", "U4", "still here")
            .await
            .unwrap();
        assert_eq!(expect_message(&mut u3).message, "still here");
    }

    #[tokio::test]
    async fn disconnected_session_receives_nothing_further() {
        let store = test_store().await;
        let registry = SessionRegistry::new();
        let mut u1 = test_session();
        let mut u2 = test_session();

        join(&store, &registry, &u1, "U1", "U2").await;
        join(&store, &registry, &u2, "U2", "U1").await;

        registry.disconnect(u2.id);

        send(&store, &registry, &u1, "U1", "U2", "anyone there")
            .await
            .unwrap();

        expect_message(&mut u1);
        assert!(u2.rx.try_recv().is_err());
    }
}
