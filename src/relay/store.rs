//! Message persistence for relay sessions.
//!
//! Messages are append-only; the relay is the only writer. Each append is a
//! single INSERT .. RETURNING, so a row is either fully present or absent.

use chrono::{SecondsFormat, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;

use crate::chat::{Message, MessageRole};

/// A storage-layer failure with the operation that hit it.
#[derive(Debug, Error)]
#[error("storage error while {operation}: {source}")]
pub struct StorageError {
    operation: &'static str,
    #[source]
    source: sqlx::Error,
}

impl StorageError {
    fn new(operation: &'static str, source: sqlx::Error) -> Self {
        Self { operation, source }
    }
}

/// What the authorize join yields: proof of access plus the project's
/// steering directive.
#[derive(Debug, Clone)]
pub struct ChatAccess {
    pub system_prompt: Option<String>,
}

/// Append/list access to chat messages.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn generate_id() -> String {
        format!("msg_{}", nanoid::nanoid!(12))
    }

    /// Check that `chat_id` lives under `project_id` and that `owner_id` owns
    /// the project. A miss does not say which condition failed.
    #[instrument(skip(self))]
    pub async fn chat_access(
        &self,
        chat_id: &str,
        project_id: &str,
        owner_id: &str,
    ) -> Result<Option<ChatAccess>, StorageError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT p.system_prompt FROM chats c \
             JOIN projects p ON c.project_id = p.id \
             WHERE c.id = ? AND c.project_id = ? AND p.user_id = ?",
        )
        .bind(chat_id)
        .bind(project_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::new("authorizing chat access", e))?;

        Ok(row.map(|(system_prompt,)| ChatAccess { system_prompt }))
    }

    /// Append a message to a chat.
    #[instrument(skip(self, content))]
    pub async fn append(
        &self,
        chat_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StorageError> {
        let id = Self::generate_id();
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (id, chat_id, role, content, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING seq, id, chat_id, role, content, created_at",
        )
        .bind(&id)
        .bind(chat_id)
        .bind(role)
        .bind(content)
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::new("appending message", e))?;

        Ok(message)
    }

    /// List a chat's messages in conversation order.
    #[instrument(skip(self))]
    pub async fn list(&self, chat_id: &str) -> Result<Vec<Message>, StorageError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT seq, id, chat_id, role, content, created_at \
             FROM messages WHERE chat_id = ? \
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::new("listing messages", e))?;

        Ok(messages)
    }
}
