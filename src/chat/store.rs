use sqlx::SqlitePool;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::ChatError;
use crate::room::normalized_pair;

use super::event::{ChatMessage, Conversation, SenderProfile};

/// Durable home for conversations; guarantees at most one row per
/// unordered participant pair.
#[derive(Clone)]
pub struct ConversationStore {
    pub(crate) pool: SqlitePool,
}

/// A conversation row, before message enrichment.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub created_at: String,
    pub updated_at: String,
}

/// What `append_message` hands back: the created row, id and timestamp
/// assigned by the server.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredMessage {
    pub fn enriched(self, sender: SenderProfile) -> ChatMessage {
        ChatMessage {
            id: self.id,
            sender,
            message: self.content,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("rfc3339 formatting")
}

fn pair_key(a: &str, b: &str) -> String {
    let (lo, hi) = normalized_pair(a, b);
    format!("{lo}_{hi}")
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find the conversation for {a, b}, creating it if this is first
    /// contact. Safe under concurrent first-contact from both sides: the
    /// insert defers to the unique pair_key and the losing caller simply
    /// reads the winner's row.
    pub async fn find_or_create(&self, a: &str, b: &str) -> Result<ConversationRecord, ChatError> {
        if a.is_empty() || b.is_empty() {
            return Err(ChatError::Validation("participant id is empty".into()));
        }
        if a == b {
            return Err(ChatError::Validation(
                "a conversation needs two distinct participants".into(),
            ));
        }

        let (lo, hi) = normalized_pair(a, b);
        let key = pair_key(a, b);
        let now = now_rfc3339();

        sqlx::query(
            "INSERT INTO conversations (id,pair_key,participant_a,participant_b,created_at,updated_at) \
             VALUES (?,?,?,?,?,?) ON CONFLICT(pair_key) DO NOTHING",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(&key)
        .bind(lo)
        .bind(hi)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id,participant_a,participant_b,created_at,updated_at \
             FROM conversations WHERE pair_key=?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        let (id, participant_a, participant_b, created_at, updated_at) =
            row.ok_or(ChatError::Conflict)?;

        Ok(ConversationRecord {
            id,
            participant_a,
            participant_b,
            created_at,
            updated_at,
        })
    }

    /// Atomically append one message and bump the conversation's
    /// updated_at. Returns the created row directly; no re-read.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<StoredMessage, ChatError> {
        if body.is_empty() {
            return Err(ChatError::Validation("message body is empty".into()));
        }

        let now = now_rfc3339();
        let id = Uuid::now_v7().to_string();

        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE conversations SET updated_at=? WHERE id=?")
            .bind(&now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(ChatError::NotFound);
        }

        sqlx::query(
            "INSERT INTO messages (id,conversation_id,sender_id,content,created_at,updated_at) \
             VALUES (?,?,?,?,?,?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(body)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_owned(),
            sender_id: sender_id.to_owned(),
            content: body.to_owned(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Read path for history (and, with `most_recent_only`, for the last
    /// appended message). Messages come back in insertion order, each
    /// enriched with the sender's display name and avatar.
    pub async fn conversation_for_pair(
        &self,
        a: &str,
        b: &str,
        most_recent_only: bool,
    ) -> Result<Option<Conversation>, ChatError> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id,participant_a,participant_b,created_at,updated_at \
             FROM conversations WHERE pair_key=?",
        )
        .bind(pair_key(a, b))
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, participant_a, participant_b, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let sql = if most_recent_only {
            "SELECT m.id,m.sender_id,m.content,m.created_at,m.updated_at,p.first_name,p.photo_url \
             FROM messages m LEFT JOIN profiles p ON p.user_id=m.sender_id \
             WHERE m.conversation_id=? ORDER BY m.rowid DESC LIMIT 1"
        } else {
            "SELECT m.id,m.sender_id,m.content,m.created_at,m.updated_at,p.first_name,p.photo_url \
             FROM messages m LEFT JOIN profiles p ON p.user_id=m.sender_id \
             WHERE m.conversation_id=? ORDER BY m.rowid ASC"
        };

        type MessageRow = (String, String, String, String, String, Option<String>, Option<String>);
        let rows: Vec<MessageRow> = sqlx::query_as(sql)
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;

        let messages = rows
            .into_iter()
            .map(|(id, sender_id, content, created_at, updated_at, first_name, photo_url)| {
                ChatMessage {
                    id,
                    sender: SenderProfile {
                        id: sender_id,
                        first_name: first_name.unwrap_or_else(|| "Anonymous".to_owned()),
                        photo_url,
                    },
                    message: content,
                    created_at,
                    updated_at,
                }
            })
            .collect();

        Ok(Some(Conversation {
            id,
            participants: [participant_a, participant_b],
            messages,
            created_at,
            updated_at,
        }))
    }

    /// Sender projection for the broadcast payload. Falls back to an
    /// anonymous name if the profile service hasn't projected this user
    /// yet.
    pub async fn sender_profile(&self, user_id: &str) -> Result<SenderProfile, ChatError> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT first_name,photo_url FROM profiles WHERE user_id=?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let (first_name, photo_url) = row.unwrap_or(("Anonymous".to_owned(), None));

        Ok(SenderProfile {
            id: user_id.to_owned(),
            first_name,
            photo_url,
        })
    }
}
