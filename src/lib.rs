pub mod chat;
pub mod db;
pub mod error;
pub mod room;
pub mod session;

use axum::extract::FromRef;
use sqlx::SqlitePool;

pub use error::{AppResult, ChatError};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: chat::ConversationStore,
    pub registry: chat::SessionRegistry,
}

impl AppState {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self {
            store: chat::ConversationStore::new(db_pool),
            registry: chat::SessionRegistry::new(),
        }
    }
}
