use serde::{Deserialize, Serialize};

// wire shapes; field names match what the frontend already speaks

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Join {
        sender_id: String,
        receiver_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        sender_id: String,
        receiver_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    MessageReceived(ChatMessage),
    Error { message: String },
}

/// A persisted message enriched with the sender's safe profile fields.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "senderId")]
    pub sender: SenderProfile,
    pub message: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// Display name and avatar only — credential fields never leave the
/// profile store.
#[derive(Debug, Clone, Serialize)]
pub struct SenderProfile {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "photoUrl")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,
    pub participants: [String; 2],
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}
