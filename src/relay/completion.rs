//! Upstream completion provider.
//!
//! The provider speaks the OpenAI-compatible chat-completions protocol:
//! `POST {base}/chat/completions` with `stream: true`, answered as SSE frames
//! of `chat.completion.chunk` payloads and a final `[DONE]` sentinel.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

use super::sse::{FrameBuffer, data_payloads};
use crate::chat::MessageRole;

/// A finite, non-restartable sequence of completion fragments. Dropping it
/// drops the underlying connection and cancels the upstream request.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

/// One prior turn of the conversation, as the provider sees it.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl From<&crate::chat::Message> for ChatTurn {
    fn from(message: &crate::chat::Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Failures talking to the completion provider.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion provider api key is not configured")]
    MissingApiKey,

    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("completion provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed completion stream: {0}")]
    Malformed(String),
}

/// Source of completion fragments for a relay session.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Open a completion stream for the given directive and conversation.
    async fn stream_completion(
        &self,
        directive: Option<&str>,
        turns: &[ChatTurn],
    ) -> Result<FragmentStream, CompletionError>;
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer key; absent means streaming requests fail until configured.
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    /// Seconds to wait for the next fragment before giving up.
    #[serde(default = "default_fragment_timeout")]
    pub fragment_timeout_secs: u64,
}

fn default_fragment_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            fragment_timeout_secs: default_fragment_timeout(),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible completion source.
#[derive(Debug, Clone)]
pub struct OpenAiCompatSource {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiCompatSource {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn build_request<'a>(
        &'a self,
        directive: Option<&'a str>,
        turns: &'a [ChatTurn],
    ) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(directive) = directive {
            messages.push(WireMessage {
                role: "system",
                content: directive,
            });
        }
        for turn in turns {
            messages.push(WireMessage {
                role: match turn.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                content: &turn.content,
            });
        }
        ChatCompletionRequest {
            model: &self.config.model,
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl CompletionSource for OpenAiCompatSource {
    async fn stream_completion(
        &self,
        directive: Option<&str>,
        turns: &[ChatTurn],
    ) -> Result<FragmentStream, CompletionError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or(CompletionError::MissingApiKey)?;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = self.build_request(directive, turns);

        debug!(model = %self.config.model, turns = turns.len(), "Opening completion stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut frames = FrameBuffer::new();

            'read: while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(CompletionError::from)?;
                frames.push_chunk(&chunk);

                while let Some(frame) = frames.next_frame() {
                    for payload in data_payloads(&frame) {
                        if payload == "[DONE]" {
                            break 'read;
                        }

                        let parsed: ChatCompletionChunk = serde_json::from_str(payload)
                            .map_err(|e| CompletionError::Malformed(e.to_string()))?;

                        let text = parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.delta.content);
                        if let Some(text) = text
                            && !text.is_empty()
                        {
                            yield text;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
