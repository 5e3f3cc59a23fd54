//! User accounts: models, persistence, registration/login rules.

mod models;
mod repository;
mod service;

pub use models::{AuthResponse, LoginRequest, RegisterRequest, User};
pub use repository::UserRepository;
pub use service::UserService;
