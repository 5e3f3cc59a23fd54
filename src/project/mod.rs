//! Projects and their prompt templates.

mod models;
mod repository;

pub use models::{CreateProjectRequest, CreatePromptRequest, Project, Prompt, UpdateProjectRequest};
pub use repository::ProjectRepository;
