//! Chats and their messages.

mod models;
mod repository;

pub use models::{Chat, Message, MessageRole};
pub use repository::ChatRepository;
