//! Bearer-token authentication: HS256 JWT issuance and verification.

mod claims;
mod error;
mod middleware;

pub use claims::Claims;
pub use error::AuthError;
pub use middleware::{CurrentUser, auth_middleware};

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Fallback signing secret for local development only.
const DEV_SECRET: &str = "change-this-secret";

/// Auth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret. Also settable via PARLOR__AUTH__SECRET.
    pub secret: Option<String>,
    /// Issued-token lifetime in hours.
    pub token_ttl_hours: i64,
    /// Origins allowed by CORS. Empty means localhost defaults.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_hours: 24 * 7,
            allowed_origins: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Build the runtime auth state, falling back to the dev secret when none
    /// is configured.
    pub fn state(&self) -> AuthState {
        let secret = match self.secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("No auth secret configured, using the development default");
                DEV_SECRET
            }
        };
        AuthState::new(secret, chrono::Duration::hours(self.token_ttl_hours))
    }
}

/// Shared authentication state: signing keys and token lifetime.
#[derive(Clone)]
pub struct AuthState {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl: chrono::Duration,
}

impl AuthState {
    pub fn new(secret: &str, token_ttl: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
                token_ttl,
            }),
        }
    }

    /// Issue a signed bearer token for a user.
    pub fn issue_token(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
        let claims = Claims::new(user_id, email, self.inner.token_ttl);
        encode(&Header::default(), &claims, &self.inner.encoding)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Verify a bearer token and return its claims.
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.inner.decoding, &Validation::default())?;
        Ok(data.claims)
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState").finish_non_exhaustive()
    }
}
