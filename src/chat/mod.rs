mod event;
mod registry;
mod store;
mod ws;

pub use event::{ChatMessage, ClientEvent, Conversation, SenderProfile, ServerEvent};
pub use registry::{SessionId, SessionRegistry};
pub use store::{ConversationStore, StoredMessage};

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    routing::get,
};
use tower_sessions::Session;

use crate::error::{AppResult, ChatError};
use crate::session::USER_ID;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::chat_ws))
        .route("/{receiver_id}", get(history))
}

// mirror of the realtime path: first fetch between a pair creates the
// (empty) conversation
#[debug_handler(state = AppState)]
async fn history(
    Path(receiver_id): Path<String>,
    State(store): State<ConversationStore>,
    session: Session,
) -> AppResult<Json<Conversation>> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Err(ChatError::Authentication);
    };

    store.find_or_create(&user_id, &receiver_id).await?;
    let conversation = store
        .conversation_for_pair(&user_id, &receiver_id, false)
        .await?
        .ok_or(ChatError::NotFound)?;

    Ok(Json(conversation))
}
