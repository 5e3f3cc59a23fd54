//! The chat streaming relay.
//!
//! One call to [`Relay::start`] carries a single user message end to end:
//! authorize the chat, load its history, persist the user message, stream the
//! provider's reply fragment by fragment, persist the assembled reply, and
//! finish with a terminal event. Failures before the stream is handed back
//! surface as [`RelayError`] (HTTP-mapped by the handler); failures after
//! that arrive as a terminal `error` event on the stream itself.

pub mod completion;
mod error;
mod events;
mod locks;
mod session;
pub mod sse;
mod store;

pub use completion::{
    ChatTurn, CompletionError, CompletionSource, FragmentStream, OpenAiCompatSource,
    ProviderConfig,
};
pub use error::RelayError;
pub use events::RelayEvent;
pub use locks::ChatLocks;
pub use store::{ChatAccess, MessageStore, StorageError};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use crate::chat::MessageRole;
use session::Session;

/// Events buffered between the session task and the SSE body before
/// backpressure kicks in.
const EVENT_BUFFER: usize = 32;

/// A single relay invocation.
#[derive(Debug)]
pub struct RelayRequest {
    pub chat_id: String,
    pub project_id: String,
    pub caller_id: String,
    pub text: String,
}

/// The relay orchestrator. Cheap to clone; shared across handlers.
#[derive(Clone)]
pub struct Relay {
    store: MessageStore,
    source: Arc<dyn CompletionSource>,
    locks: Arc<ChatLocks>,
    fragment_timeout: Duration,
}

impl Relay {
    pub fn new(
        store: MessageStore,
        source: Arc<dyn CompletionSource>,
        fragment_timeout: Duration,
    ) -> Self {
        Self {
            store,
            source,
            locks: Arc::new(ChatLocks::new()),
            fragment_timeout,
        }
    }

    /// Run the synchronous phases and hand back the event stream.
    ///
    /// Validation, authorization, history load, and the user-message insert
    /// all happen before this returns, so their failures map to plain HTTP
    /// statuses. The returned stream then yields `userMessage`, the chunks,
    /// and one terminal event.
    #[instrument(skip(self, request), fields(chat_id = %request.chat_id, caller_id = %request.caller_id))]
    pub async fn start(
        &self,
        request: RelayRequest,
    ) -> Result<ReceiverStream<RelayEvent>, RelayError> {
        let text = request.text.trim().to_string();
        if text.is_empty() {
            return Err(RelayError::InvalidInput);
        }

        // Exclusion is taken before the history read so a concurrent session
        // on the same chat cannot interleave its writes with ours.
        let guard = self.locks.acquire(&request.chat_id).await;

        let access = self
            .store
            .chat_access(&request.chat_id, &request.project_id, &request.caller_id)
            .await?
            .ok_or(RelayError::NotFound)?;

        let history = self.store.list(&request.chat_id).await?;
        let user_message = self
            .store
            .append(&request.chat_id, MessageRole::User, &text)
            .await?;

        let mut turns: Vec<ChatTurn> = history.iter().map(ChatTurn::from).collect();
        turns.push(ChatTurn::from(&user_message));

        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session_id, turns = turns.len(), "Starting relay session");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = Session {
            store: self.store.clone(),
            source: self.source.clone(),
            tx,
            guard,
            session_id,
            chat_id: request.chat_id,
            fragment_timeout: self.fragment_timeout,
        };
        tokio::spawn(session.run(access.system_prompt, turns, user_message));

        Ok(ReceiverStream::new(rx))
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("fragment_timeout", &self.fragment_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted completion source: each call pops the next script and records
    /// the turns it was given.
    struct ScriptedSource {
        scripts: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<Vec<ChatTurn>>>,
    }

    enum Script {
        Reply(Vec<&'static str>),
        SlowReply(Vec<&'static str>, Duration),
        FailAfter(Vec<&'static str>, &'static str),
        Hang,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn recorded_calls(&self) -> Vec<Vec<ChatTurn>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionSource for ScriptedSource {
        async fn stream_completion(
            &self,
            _directive: Option<&str>,
            turns: &[ChatTurn],
        ) -> Result<FragmentStream, CompletionError> {
            self.calls.lock().unwrap().push(turns.to_vec());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("no script left for completion call");

            let stream: FragmentStream = match script {
                Script::Reply(fragments) => Box::pin(futures::stream::iter(
                    fragments.into_iter().map(|f| Ok(f.to_string())).collect::<Vec<_>>(),
                )),
                Script::SlowReply(fragments, delay) => Box::pin(async_stream::stream! {
                    for fragment in fragments {
                        tokio::time::sleep(delay).await;
                        yield Ok(fragment.to_string());
                    }
                }),
                Script::FailAfter(fragments, message) => Box::pin(async_stream::stream! {
                    for fragment in fragments {
                        yield Ok(fragment.to_string());
                    }
                    yield Err(CompletionError::Malformed(message.to_string()));
                }),
                Script::Hang => Box::pin(futures::stream::pending()),
            };
            Ok(stream)
        }
    }

    async fn setup(scripts: Vec<Script>) -> (Relay, Arc<ScriptedSource>, MessageStore) {
        let db = Database::in_memory().await.unwrap();
        sqlx::raw_sql(
            "INSERT INTO users (id, email, password_hash) VALUES ('usr_1', 'a@b.c', 'x');
             INSERT INTO users (id, email, password_hash) VALUES ('usr_2', 'b@b.c', 'x');
             INSERT INTO projects (id, user_id, name, system_prompt)
                 VALUES ('prj_1', 'usr_1', 'p', 'Be helpful.');
             INSERT INTO chats (id, project_id) VALUES ('cht_1', 'prj_1');",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let store = MessageStore::new(db.pool().clone());
        let source = ScriptedSource::new(scripts);
        let relay = Relay::new(
            store.clone(),
            source.clone(),
            Duration::from_secs(5),
        );
        (relay, source, store)
    }

    fn request(text: &str) -> RelayRequest {
        RelayRequest {
            chat_id: "cht_1".to_string(),
            project_id: "prj_1".to_string(),
            caller_id: "usr_1".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_session_grammar_and_persistence() {
        let (relay, _, store) = setup(vec![Script::Reply(vec!["Hel", "lo ", "there"])]).await;

        let stream = relay.start(request("hi")).await.unwrap();
        let events: Vec<RelayEvent> = stream.collect().await;

        // userMessage, chunk*, done; the terminal event closes the grammar
        assert!(matches!(events.first(), Some(RelayEvent::UserMessage { .. })));
        assert!(matches!(events.last(), Some(RelayEvent::Done { .. })));
        let (last, rest) = events.split_last().unwrap();
        assert!(last.is_terminal());
        assert!(rest.iter().all(|e| !e.is_terminal()));
        let chunks: String = events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, "Hello there");

        let RelayEvent::Done { message } = events.last().unwrap() else {
            unreachable!()
        };
        assert_eq!(message.content, "Hello there");
        assert_eq!(message.role, MessageRole::Assistant);

        // Exactly two messages persisted, in order
        let persisted = store.list("cht_1").await.unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].content, "hi");
        assert_eq!(persisted[1].content, "Hello there");
    }

    #[tokio::test]
    async fn test_empty_input_has_no_side_effects() {
        let (relay, source, store) = setup(vec![]).await;

        assert!(matches!(
            relay.start(request("   ")).await,
            Err(RelayError::InvalidInput)
        ));
        assert!(store.list("cht_1").await.unwrap().is_empty());
        assert!(source.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_and_missing_chats_are_the_same_miss() {
        let (relay, _, store) = setup(vec![]).await;

        let foreign = RelayRequest {
            caller_id: "usr_2".to_string(),
            ..request("hi")
        };
        assert!(matches!(
            relay.start(foreign).await,
            Err(RelayError::NotFound)
        ));

        let missing = RelayRequest {
            chat_id: "cht_nope".to_string(),
            ..request("hi")
        };
        assert!(matches!(
            relay.start(missing).await,
            Err(RelayError::NotFound)
        ));

        assert!(store.list("cht_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_user_message_only() {
        let (relay, _, store) =
            setup(vec![Script::FailAfter(vec!["par", "tial"], "stream broke")]).await;

        let stream = relay.start(request("hi")).await.unwrap();
        let events: Vec<RelayEvent> = stream.collect().await;

        let RelayEvent::Error { error } = events.last().unwrap() else {
            panic!("expected terminal error, got {:?}", events.last());
        };
        assert!(error.contains("stream broke"));
        // Exactly one terminal event, even on the failure path
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        // Partial chunks were delivered but never persisted
        assert!(events.iter().any(|e| matches!(e, RelayEvent::Chunk { .. })));
        let persisted = store.list("cht_1").await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_fragment_timeout_fails_session() {
        let (_, source, store) = setup(vec![Script::Hang]).await;
        let relay = Relay::new(store.clone(), source, Duration::from_millis(50));

        let stream = relay.start(request("hi")).await.unwrap();
        let events: Vec<RelayEvent> = stream.collect().await;

        let RelayEvent::Error { error } = events.last().unwrap() else {
            panic!("expected terminal error");
        };
        assert!(error.contains("timed out"));
        assert_eq!(store.list("cht_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_assistant_persist_failure_yields_terminal_error() {
        let db = Database::in_memory().await.unwrap();
        sqlx::raw_sql(
            "INSERT INTO users (id, email, password_hash) VALUES ('usr_1', 'a@b.c', 'x');
             INSERT INTO projects (id, user_id, name) VALUES ('prj_1', 'usr_1', 'p');
             INSERT INTO chats (id, project_id) VALUES ('cht_1', 'prj_1');",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let store = MessageStore::new(db.pool().clone());
        let source = ScriptedSource::new(vec![Script::SlowReply(
            vec!["par", "tial"],
            Duration::from_millis(30),
        )]);
        let relay = Relay::new(store.clone(), source, Duration::from_secs(5));

        let stream = relay.start(request("hi")).await.unwrap();
        // Pull the chat out from under the session while the reply streams;
        // the assistant insert then has no parent row and fails every attempt
        sqlx::query("DELETE FROM chats WHERE id = 'cht_1'")
            .execute(db.pool())
            .await
            .unwrap();

        let events: Vec<RelayEvent> = stream.collect().await;

        assert!(matches!(events.first(), Some(RelayEvent::UserMessage { .. })));
        assert!(events.iter().any(|e| matches!(e, RelayEvent::Chunk { .. })));
        assert!(!events.iter().any(|e| matches!(e, RelayEvent::Done { .. })));
        let RelayEvent::Error { error } = events.last().unwrap() else {
            panic!("expected terminal error, got {:?}", events.last());
        };
        assert!(error.contains("persist"));

        // The cascade removed every row and the failed insert left none behind
        assert!(store.list("cht_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_aborts_without_assistant_persist() {
        let (relay, _, store) = setup(vec![Script::SlowReply(
            vec!["a", "b", "c", "d"],
            Duration::from_millis(20),
        )])
        .await;

        let mut stream = relay.start(request("hi")).await.unwrap();
        // Take the first event, then walk away mid-stream
        let first = stream.next().await.unwrap();
        assert!(matches!(first, RelayEvent::UserMessage { .. }));
        drop(stream);

        // Give the session time to notice the closed channel
        tokio::time::sleep(Duration::from_millis(200)).await;

        let persisted = store.list("cht_1").await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].role, MessageRole::User);

        // The chat lock was released; a later session proceeds normally
        let relay2 = Relay::new(
            store.clone(),
            ScriptedSource::new(vec![Script::Reply(vec!["ok"])]),
            Duration::from_secs(5),
        );
        let events: Vec<RelayEvent> = relay2.start(request("again")).await.unwrap().collect().await;
        assert!(matches!(events.last(), Some(RelayEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_on_one_chat_are_serialized() {
        let (relay, source, _) = setup(vec![
            Script::SlowReply(vec!["first ", "reply"], Duration::from_millis(20)),
            Script::Reply(vec!["second reply"]),
        ])
        .await;

        let relay2 = relay.clone();
        let (events_a, events_b) = tokio::join!(
            async {
                let stream = relay.start(request("one")).await.unwrap();
                stream.collect::<Vec<_>>().await
            },
            async {
                // Arrive a beat later so the first session holds the lock
                tokio::time::sleep(Duration::from_millis(5)).await;
                let stream = relay2.start(request("two")).await.unwrap();
                stream.collect::<Vec<_>>().await
            }
        );

        assert!(matches!(events_a.last(), Some(RelayEvent::Done { .. })));
        assert!(matches!(events_b.last(), Some(RelayEvent::Done { .. })));

        // The second session observed the first one's full exchange
        let calls = source.recorded_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[1].len(), 3);
        assert_eq!(calls[1][0].content, "one");
        assert_eq!(calls[1][1].content, "first reply");
        assert_eq!(calls[1][2].content, "two");
    }

    #[tokio::test]
    async fn test_directive_reaches_the_source() {
        struct DirectiveProbe(Mutex<Option<String>>);

        #[async_trait]
        impl CompletionSource for DirectiveProbe {
            async fn stream_completion(
                &self,
                directive: Option<&str>,
                _turns: &[ChatTurn],
            ) -> Result<FragmentStream, CompletionError> {
                *self.0.lock().unwrap() = directive.map(String::from);
                Ok(Box::pin(futures::stream::empty()))
            }
        }

        let (_, _, store) = setup(vec![]).await;
        let probe = Arc::new(DirectiveProbe(Mutex::new(None)));
        let relay = Relay::new(store, probe.clone(), Duration::from_secs(5));

        let events: Vec<RelayEvent> = relay.start(request("hi")).await.unwrap().collect().await;
        assert!(matches!(events.last(), Some(RelayEvent::Done { .. })));
        assert_eq!(probe.0.lock().unwrap().as_deref(), Some("Be helpful."));
    }
}
