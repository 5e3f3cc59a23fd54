//! Chat and message models.

use serde::{Deserialize, Serialize};

/// A conversation under a project.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Chat {
    pub id: String,
    pub project_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// An immutable message in a chat.
///
/// `seq` is the insertion sequence; (created_at, seq) is the total order even
/// when two messages land within the same millisecond.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub seq: i64,
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}
