//! Shared application state.

use crate::auth::AuthState;
use crate::chat::ChatRepository;
use crate::db::Database;
use crate::project::ProjectRepository;
use crate::relay::{MessageStore, Relay};
use crate::user::UserService;

/// Everything handlers need, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: AuthState,
    pub users: UserService,
    pub projects: ProjectRepository,
    pub chats: ChatRepository,
    pub messages: MessageStore,
    pub relay: Relay,
}
