//! Relay error taxonomy.

use thiserror::Error;

use super::store::StorageError;

/// Failures in the synchronous phase, before the event stream is handed back.
///
/// HTTP mapping happens at the handler boundary only. The completion source
/// opens inside the spawned session, so upstream failures never appear here;
/// they surface as a terminal `error` event on the stream instead.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The incoming message was empty or missing.
    #[error("message is required")]
    InvalidInput,

    /// Chat missing, project mismatch, or foreign owner. Deliberately one
    /// variant: callers cannot probe for other users' chats.
    #[error("chat not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
