//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tracing::{instrument, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::auth::CurrentUser;
use crate::chat::{Chat, Message};
use crate::project::{
    CreateProjectRequest, CreatePromptRequest, Project, Prompt, UpdateProjectRequest,
};
use crate::relay::RelayRequest;
use crate::user::{AuthResponse, LoginRequest, RegisterRequest, User};

// ---------------------------------------------------------------------------
// Health

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    if !state.db.is_healthy().await {
        return Err(ApiError::internal("Database unavailable"));
    }
    Ok(Json(HealthResponse { status: "ok" }))
}

// ---------------------------------------------------------------------------
// Auth

#[instrument(skip(state, request), fields(email = %request.email))]
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let user = state
        .users
        .register(&request.email, &request.password)
        .await?;
    let token = state.auth.issue_token(&user.id, &user.email)?;

    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

#[instrument(skip(state, request), fields(email = %request.email))]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let user = state.users.login(&request.email, &request.password).await?;
    let token = state.auth.issue_token(&user.id, &user.email)?;

    Ok(Json(AuthResponse { token, user }))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
}

pub async fn me(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Json<MeResponse>> {
    let user = state
        .users
        .repository()
        .get(&user.id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Account no longer exists"))?;

    Ok(Json(MeResponse { user }))
}

// ---------------------------------------------------------------------------
// Projects

#[derive(Debug, Serialize)]
pub struct ProjectListResponse {
    pub projects: Vec<Project>,
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub project: Project,
}

pub async fn list_projects(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ProjectListResponse>> {
    let projects = state.projects.list(&user.id).await?;
    Ok(Json(ProjectListResponse { projects }))
}

#[instrument(skip(state, request), fields(user_id = %user.id))]
pub async fn create_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectResponse>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Project name is required"));
    }

    let project = state.projects.create(&user.id, request).await?;
    Ok((StatusCode::CREATED, Json(ProjectResponse { project })))
}

pub async fn get_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectResponse>> {
    let project = state
        .projects
        .get(&project_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;

    Ok(Json(ProjectResponse { project }))
}

pub async fn update_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
    Json(request): Json<UpdateProjectRequest>,
) -> ApiResult<Json<ProjectResponse>> {
    let project = state
        .projects
        .update(&project_id, &user.id, request)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;

    Ok(Json(ProjectResponse { project }))
}

pub async fn delete_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.projects.delete(&project_id, &user.id).await? {
        return Err(ApiError::not_found("Project not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Prompts

#[derive(Debug, Serialize)]
pub struct PromptListResponse {
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Serialize)]
pub struct PromptResponse {
    pub prompt: Prompt,
}

pub async fn list_prompts(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<PromptListResponse>> {
    // Distinguish an empty project from a missing one
    state
        .projects
        .get(&project_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;

    let prompts = state.projects.list_prompts(&project_id, &user.id).await?;
    Ok(Json(PromptListResponse { prompts }))
}

pub async fn create_prompt(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
    Json(request): Json<CreatePromptRequest>,
) -> ApiResult<(StatusCode, Json<PromptResponse>)> {
    if request.name.trim().is_empty() || request.content.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt name and content are required"));
    }

    let prompt = state
        .projects
        .create_prompt(&project_id, &user.id, &request.name, &request.content)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;

    Ok((StatusCode::CREATED, Json(PromptResponse { prompt })))
}

pub async fn delete_prompt(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((project_id, prompt_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if !state
        .projects
        .delete_prompt(&project_id, &prompt_id, &user.id)
        .await?
    {
        return Err(ApiError::not_found("Prompt not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Chats

#[derive(Debug, Serialize)]
pub struct ChatListResponse {
    pub chats: Vec<Chat>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub chat: Chat,
}

#[derive(Debug, Serialize)]
pub struct ChatWithMessagesResponse {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

pub async fn list_chats(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ChatListResponse>> {
    state
        .projects
        .get(&project_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;

    let chats = state.chats.list(&project_id, &user.id).await?;
    Ok(Json(ChatListResponse { chats }))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn create_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<(StatusCode, Json<ChatResponse>)> {
    let chat = state
        .chats
        .create(&project_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;

    Ok((StatusCode::CREATED, Json(ChatResponse { chat })))
}

pub async fn get_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((project_id, chat_id)): Path<(String, String)>,
) -> ApiResult<Json<ChatWithMessagesResponse>> {
    let chat = state
        .chats
        .get(&chat_id, &project_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat not found"))?;

    let messages = state.messages.list(&chat_id).await.map_err(|e| {
        warn!("Failed to list messages: {}", e);
        ApiError::internal("Storage failure")
    })?;

    Ok(Json(ChatWithMessagesResponse { chat, messages }))
}

pub async fn delete_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((project_id, chat_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if !state.chats.delete(&chat_id, &project_id, &user.id).await? {
        return Err(ApiError::not_found("Chat not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Streaming relay

#[derive(Debug, Deserialize)]
pub struct StreamMessageRequest {
    /// Absent and empty are treated the same: rejected before any write.
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /projects/{project_id}/chats/{chat_id}/messages/stream`
///
/// Single-pass SSE response: the persisted user message, then each completion
/// fragment as its own event, then one terminal `done` or `error`.
#[instrument(skip(state, request), fields(user_id = %user.id, chat_id = %chat_id))]
pub async fn stream_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((project_id, chat_id)): Path<(String, String)>,
    Json(request): Json<StreamMessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state
        .relay
        .start(RelayRequest {
            chat_id,
            project_id,
            caller_id: user.id,
            text: request.message.unwrap_or_default(),
        })
        .await?;

    let stream = events.map(|event| {
        let event = match serde_json::to_string(&event) {
            Ok(json) => Event::default().data(json),
            Err(e) => {
                warn!("Failed to encode relay event: {}", e);
                Event::default().data(r#"{"type":"error","error":"event encoding failure"}"#)
            }
        };
        Ok(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
