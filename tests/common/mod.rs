//! Shared test harness: an in-memory app wired to a scripted completion
//! source.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::Value;
use tower::ServiceExt;

use parlor::api::{AppState, create_router};
use parlor::auth::AuthConfig;
use parlor::chat::ChatRepository;
use parlor::db::Database;
use parlor::project::ProjectRepository;
use parlor::relay::{
    ChatTurn, CompletionError, CompletionSource, FragmentStream, MessageStore, Relay,
};
use parlor::user::{UserRepository, UserService};

/// One scripted provider exchange.
pub enum Script {
    /// Yield these fragments, then end cleanly.
    Reply(Vec<&'static str>),
    /// Yield these fragments, then fail with the given message.
    FailAfter(Vec<&'static str>, &'static str),
}

/// Completion source that plays back scripts in order, one per call.
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

#[async_trait]
impl CompletionSource for ScriptedSource {
    async fn stream_completion(
        &self,
        _directive: Option<&str>,
        _turns: &[ChatTurn],
    ) -> Result<FragmentStream, CompletionError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script queued for completion call");

        let stream: FragmentStream = match script {
            Script::Reply(fragments) => Box::pin(futures::stream::iter(
                fragments
                    .into_iter()
                    .map(|f| Ok(f.to_string()))
                    .collect::<Vec<_>>(),
            )),
            Script::FailAfter(fragments, message) => Box::pin(async_stream::stream! {
                for fragment in fragments {
                    yield Ok(fragment.to_string());
                }
                yield Err(CompletionError::Malformed(message.to_string()));
            }),
        };
        Ok(stream)
    }
}

pub struct TestApp {
    pub router: Router,
    pub source: Arc<ScriptedSource>,
}

/// Build an app backed by an in-memory database and a scripted source.
pub async fn test_app() -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let auth = AuthConfig {
        secret: Some("integration-test-secret".to_string()),
        ..Default::default()
    };

    let source = ScriptedSource::new();
    let pool = db.pool().clone();
    let messages = MessageStore::new(pool.clone());

    let state = AppState {
        db,
        auth: auth.state(),
        users: UserService::new(UserRepository::new(pool.clone())),
        projects: ProjectRepository::new(pool.clone()),
        chats: ChatRepository::new(pool),
        messages: messages.clone(),
        relay: Relay::new(messages, source.clone(), Duration::from_secs(5)),
    };

    TestApp {
        router: create_router(state, &[]),
        source,
    }
}

/// Issue a JSON request, returning status and parsed body (Null when empty).
pub async fn send_json(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// Register a fresh account and return its bearer token.
pub async fn register(app: &Router, email: &str) -> String {
    let (status, body) = send_json(
        app,
        Method::POST,
        "/auth/register",
        None,
        Some(serde_json::json!({ "email": email, "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {body}");
    body["token"].as_str().unwrap().to_string()
}

pub async fn create_project(app: &Router, token: &str, name: &str) -> String {
    let (status, body) = send_json(
        app,
        Method::POST,
        "/projects",
        Some(token),
        Some(serde_json::json!({ "name": name, "system_prompt": "Be concise." })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create project failed: {body}");
    body["project"]["id"].as_str().unwrap().to_string()
}

pub async fn create_chat(app: &Router, token: &str, project_id: &str) -> String {
    let (status, body) = send_json(
        app,
        Method::POST,
        &format!("/projects/{project_id}/chats"),
        Some(token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create chat failed: {body}");
    body["chat"]["id"].as_str().unwrap().to_string()
}

/// Send one message on the streaming endpoint and return (status, events).
///
/// Collecting the body drives the relay session to its terminal event.
pub async fn stream_message(
    app: &Router,
    token: &str,
    project_id: &str,
    chat_id: &str,
    body: Value,
) -> (StatusCode, Vec<Value>) {
    let request = Request::builder()
        .uri(format!(
            "/projects/{project_id}/chats/{chat_id}/messages/stream"
        ))
        .method(Method::POST)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();

    if status != StatusCode::OK {
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        return (status, vec![json]);
    }

    (status, parse_sse_events(&String::from_utf8_lossy(&bytes)))
}

/// Parse an SSE body into the JSON payload of each `data:` frame.
pub fn parse_sse_events(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .flat_map(|frame| frame.lines())
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}
