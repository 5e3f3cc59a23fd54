//! The per-session worker task.
//!
//! Runs after the synchronous phases (authorize, history, user persist) have
//! succeeded and the SSE response is on its way out. Owns the chat lock for
//! its whole lifetime; the lock releases when the task finishes or is
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{debug, error, instrument, warn};

use super::completion::{ChatTurn, CompletionSource};
use super::events::RelayEvent;
use super::store::MessageStore;
use crate::chat::{Message, MessageRole};

/// Attempts for the final assistant insert. The reply already streamed to the
/// client by then, so a transient storage hiccup should not discard it.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(250);

pub(super) struct Session {
    pub store: MessageStore,
    pub source: Arc<dyn CompletionSource>,
    pub tx: mpsc::Sender<RelayEvent>,
    pub guard: OwnedMutexGuard<()>,
    pub session_id: String,
    pub chat_id: String,
    pub fragment_timeout: Duration,
}

impl Session {
    /// Drive the session to its terminal event.
    ///
    /// A failed send means the client is gone: the session aborts at that
    /// suspension point and the assistant message is not persisted.
    #[instrument(skip_all, fields(session_id = %self.session_id, chat_id = %self.chat_id))]
    pub(super) async fn run(
        self,
        directive: Option<String>,
        turns: Vec<ChatTurn>,
        user_message: Message,
    ) {
        // Guard is held until this task returns
        let _guard = &self.guard;

        if self.emit(RelayEvent::UserMessage { message: user_message }).await.is_err() {
            warn!("Client disconnected before the first event");
            return;
        }

        debug!(phase = "streaming", turns = turns.len(), "Opening completion stream");
        let stream = match self
            .source
            .stream_completion(directive.as_deref(), &turns)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&e.to_string()).await;
                return;
            }
        };
        tokio::pin!(stream);

        let mut reply = String::new();
        loop {
            let next = tokio::time::timeout(self.fragment_timeout, stream.next()).await;
            match next {
                Err(_) => {
                    self.fail("timed out waiting for the completion provider").await;
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    self.fail(&e.to_string()).await;
                    return;
                }
                Ok(Some(Ok(fragment))) => {
                    reply.push_str(&fragment);
                    if self.emit(RelayEvent::Chunk { content: fragment }).await.is_err() {
                        warn!("Client disconnected mid-stream, aborting session");
                        return;
                    }
                }
            }
        }

        debug!(phase = "persisting_assistant", chars = reply.len(), "Completion stream drained");
        match self.persist_assistant(&reply).await {
            Ok(message) => {
                debug!(phase = "completed", "Session completed");
                let _ = self.emit(RelayEvent::Done { message }).await;
            }
            Err(e) => {
                error!("Failed to persist assistant message: {}", e);
                self.fail("failed to persist assistant message").await;
            }
        }
    }

    /// Insert the assembled reply, retrying transient storage failures.
    async fn persist_assistant(&self, reply: &str) -> Result<Message, super::store::StorageError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .append(&self.chat_id, MessageRole::Assistant, reply)
                .await
            {
                Ok(message) => return Ok(message),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(attempt, "Assistant persist failed, retrying: {}", e);
                    attempt += 1;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(&self, reason: &str) {
        error!(phase = "failed", "Relay session failed: {}", reason);
        let _ = self
            .emit(RelayEvent::Error {
                error: reason.to_string(),
            })
            .await;
    }

    async fn emit(&self, event: RelayEvent) -> Result<(), ()> {
        self.tx.send(event).await.map_err(|_| ())
    }
}
