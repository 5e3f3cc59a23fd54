//! Account registration and credential checks.

use anyhow::Result;
use bcrypt::{DEFAULT_COST, hash, verify};
use tracing::{debug, instrument, warn};

use super::models::User;
use super::repository::UserRepository;
use crate::auth::AuthError;

const MIN_PASSWORD_LEN: usize = 8;

/// Service wrapping registration and login rules on top of the repository.
#[derive(Debug, Clone)]
pub struct UserService {
    repository: UserRepository,
}

impl UserService {
    pub fn new(repository: UserRepository) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &UserRepository {
        &self.repository
    }

    /// Register a new account. The password is bcrypt-hashed before storage.
    #[instrument(skip(self, password))]
    pub async fn register(&self, email: &str, password: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            anyhow::bail!("Invalid email address");
        }
        if password.len() < MIN_PASSWORD_LEN {
            anyhow::bail!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            );
        }
        if !self.repository.is_email_available(&email).await? {
            anyhow::bail!("Email '{}' is already registered", email);
        }

        let password_hash = hash(password, DEFAULT_COST)?;
        let user = self.repository.create(&email, &password_hash).await?;

        debug!("Registered user {}", user.id);
        Ok(user)
    }

    /// Verify credentials and return the account.
    ///
    /// Unknown email and wrong password are indistinguishable to the caller.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = email.trim().to_lowercase();

        let user = self
            .repository
            .get_by_email(&email)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or(AuthError::InvalidCredentials)?;

        let matches = verify(password, &user.password_hash)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        if !matches {
            warn!("Failed login attempt for {}", user.id);
            return Err(AuthError::InvalidCredentials);
        }

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup_service() -> UserService {
        let db = Database::in_memory().await.unwrap();
        UserService::new(UserRepository::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let service = setup_service().await;

        let user = service
            .register("Test@Example.com", "password123")
            .await
            .unwrap();
        // Emails are normalized to lowercase
        assert_eq!(user.email, "test@example.com");
        assert_ne!(user.password_hash, "password123");

        let logged_in = service
            .login("test@example.com", "password123")
            .await
            .unwrap();
        assert_eq!(logged_in.id, user.id);
    }

    #[tokio::test]
    async fn test_register_rejects_short_password() {
        let service = setup_service().await;
        let err = service
            .register("a@b.c", "short")
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("must be at least"));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_email() {
        let service = setup_service().await;
        service.register("dup@b.c", "password123").await.unwrap();
        let err = service
            .register("dup@b.c", "password456")
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("already registered"));
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let service = setup_service().await;
        service.register("a@b.c", "password123").await.unwrap();

        assert!(matches!(
            service.login("a@b.c", "wrong-password").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            service.login("missing@b.c", "password123").await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}
