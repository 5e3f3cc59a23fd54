//! Project and prompt repository.
//!
//! Every query is scoped to the owning user; a row that exists but belongs to
//! someone else is reported exactly like a missing row.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{CreateProjectRequest, Project, Prompt, UpdateProjectRequest};

const PROJECT_COLUMNS: &str =
    "id, user_id, name, description, system_prompt, created_at, updated_at";
const PROMPT_COLUMNS: &str = "id, project_id, name, content, created_at, updated_at";

/// Repository for project and prompt database operations.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn generate_project_id() -> String {
        format!("prj_{}", nanoid::nanoid!(12))
    }

    fn generate_prompt_id() -> String {
        format!("pmt_{}", nanoid::nanoid!(12))
    }

    /// List a user's projects, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self, user_id: &str) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE user_id = ? ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list projects")?;

        Ok(projects)
    }

    /// Get one of the user's projects by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str, user_id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch project")?;

        Ok(project)
    }

    /// Create a project for a user.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, user_id: &str, request: CreateProjectRequest) -> Result<Project> {
        let id = Self::generate_project_id();

        debug!("Creating project: {} ({})", request.name, id);

        let project = sqlx::query_as::<_, Project>(&format!(
            "INSERT INTO projects (id, user_id, name, description, system_prompt) \
             VALUES (?, ?, ?, ?, ?) RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(&id)
        .bind(user_id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.system_prompt)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert project")?;

        Ok(project)
    }

    /// Update a project. Absent fields keep their current value.
    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        id: &str,
        user_id: &str,
        request: UpdateProjectRequest,
    ) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "UPDATE projects SET \
                 name = COALESCE(?, name), \
                 description = COALESCE(?, description), \
                 system_prompt = COALESCE(?, system_prompt), \
                 updated_at = datetime('now') \
             WHERE id = ? AND user_id = ? \
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.system_prompt)
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update project")?;

        Ok(project)
    }

    /// Delete a project. Returns false if it didn't exist or isn't owned by
    /// the user. Prompts, chats, and messages underneath cascade away.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete project")?;

        Ok(result.rows_affected() > 0)
    }

    /// List prompts under one of the user's projects.
    #[instrument(skip(self))]
    pub async fn list_prompts(&self, project_id: &str, user_id: &str) -> Result<Vec<Prompt>> {
        let prompts = sqlx::query_as::<_, Prompt>(&format!(
            "SELECT p.{} FROM prompts p \
             JOIN projects pr ON p.project_id = pr.id \
             WHERE p.project_id = ? AND pr.user_id = ? \
             ORDER BY p.created_at DESC",
            PROMPT_COLUMNS.replace(", ", ", p.")
        ))
        .bind(project_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list prompts")?;

        Ok(prompts)
    }

    /// Create a prompt under one of the user's projects.
    ///
    /// Returns None when the project is missing or not owned by the user.
    #[instrument(skip(self, name, content))]
    pub async fn create_prompt(
        &self,
        project_id: &str,
        user_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Option<Prompt>> {
        if self.get(project_id, user_id).await?.is_none() {
            return Ok(None);
        }

        let id = Self::generate_prompt_id();
        let prompt = sqlx::query_as::<_, Prompt>(&format!(
            "INSERT INTO prompts (id, project_id, name, content) \
             VALUES (?, ?, ?, ?) RETURNING {PROMPT_COLUMNS}"
        ))
        .bind(&id)
        .bind(project_id)
        .bind(name)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert prompt")?;

        Ok(Some(prompt))
    }

    /// Delete a prompt under one of the user's projects.
    #[instrument(skip(self))]
    pub async fn delete_prompt(
        &self,
        project_id: &str,
        prompt_id: &str,
        user_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM prompts WHERE id = ? AND project_id IN \
             (SELECT id FROM projects WHERE id = ? AND user_id = ?)",
        )
        .bind(prompt_id)
        .bind(project_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to delete prompt")?;

        Ok(result.rows_affected() > 0)
    }
}
