//! Parlor: a project-scoped AI chat workspace server.
//!
//! Users organize chats under projects, each optionally carrying a system
//! directive, and converse with an OpenAI-compatible completion provider.
//! The core path is the streaming relay in [`relay`]: one POST carries a user
//! message through authorization, persistence, live token streaming, and
//! final persistence of the reply, all inside a single SSE response.

pub mod api;
pub mod auth;
pub mod chat;
pub mod db;
pub mod project;
pub mod relay;
pub mod user;
