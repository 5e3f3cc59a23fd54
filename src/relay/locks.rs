//! Per-chat mutual exclusion.
//!
//! At most one relay session may be active per chat; a second sender on the
//! same chat waits here until the first session reaches its terminal event.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-chat locks. Entries are tiny and bounded by the number of
/// distinct chats touched since startup.
#[derive(Debug, Default)]
pub struct ChatLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a chat, waiting if another session holds it.
    /// The guard is owned so it can move into the session task.
    pub async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
