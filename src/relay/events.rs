//! Wire events emitted over the streaming response.
//!
//! Grammar per session: exactly one `userMessage`, zero or more `chunk`s,
//! then exactly one of `done` or `error`. The transport ends right after the
//! terminal event.

use serde::{Deserialize, Serialize};

use crate::chat::Message;

/// One server-sent event in a relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayEvent {
    /// The persisted copy of the caller's message, echoed before streaming.
    UserMessage { message: Message },
    /// A verbatim completion fragment.
    Chunk { content: String },
    /// Terminal success: the persisted assistant message.
    Done { message: Message },
    /// Terminal failure.
    Error { error: String },
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Done { .. } | RelayEvent::Error { .. })
    }
}
