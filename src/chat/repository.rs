//! Chat repository. Ownership is transitive: a chat is visible to whoever
//! owns its project.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::Chat;

const CHAT_COLUMNS: &str = "id, project_id, created_at, updated_at";

/// Repository for chat database operations.
#[derive(Debug, Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn generate_id() -> String {
        format!("cht_{}", nanoid::nanoid!(12))
    }

    /// List chats under one of the user's projects, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self, project_id: &str, user_id: &str) -> Result<Vec<Chat>> {
        let chats = sqlx::query_as::<_, Chat>(&format!(
            "SELECT c.{} FROM chats c \
             JOIN projects p ON c.project_id = p.id \
             WHERE c.project_id = ? AND p.user_id = ? \
             ORDER BY c.created_at DESC",
            CHAT_COLUMNS.replace(", ", ", c.")
        ))
        .bind(project_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list chats")?;

        Ok(chats)
    }

    /// Get a chat by ID, scoped to the project and its owner.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str, project_id: &str, user_id: &str) -> Result<Option<Chat>> {
        let chat = sqlx::query_as::<_, Chat>(&format!(
            "SELECT c.{} FROM chats c \
             JOIN projects p ON c.project_id = p.id \
             WHERE c.id = ? AND c.project_id = ? AND p.user_id = ?",
            CHAT_COLUMNS.replace(", ", ", c.")
        ))
        .bind(id)
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chat")?;

        Ok(chat)
    }

    /// Create a chat under one of the user's projects.
    ///
    /// Returns None when the project is missing or not owned by the user.
    #[instrument(skip(self))]
    pub async fn create(&self, project_id: &str, user_id: &str) -> Result<Option<Chat>> {
        let owned: Option<(String,)> =
            sqlx::query_as("SELECT id FROM projects WHERE id = ? AND user_id = ?")
                .bind(project_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to check project ownership")?;
        if owned.is_none() {
            return Ok(None);
        }

        let id = Self::generate_id();
        debug!("Creating chat {} under project {}", id, project_id);

        let chat = sqlx::query_as::<_, Chat>(&format!(
            "INSERT INTO chats (id, project_id) VALUES (?, ?) RETURNING {CHAT_COLUMNS}"
        ))
        .bind(&id)
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert chat")?;

        Ok(Some(chat))
    }

    /// Delete a chat. Messages underneath cascade away.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str, project_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM chats WHERE id = ? AND project_id IN \
             (SELECT id FROM projects WHERE id = ? AND user_id = ?)",
        )
        .bind(id)
        .bind(project_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to delete chat")?;

        Ok(result.rows_affected() > 0)
    }
}
