//! JWT claims.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// JWT claims structure for issued bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// User's email.
    pub email: String,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    pub iat: i64,
}

impl Claims {
    /// Build claims for a user with the given time-to-live.
    pub fn new(user_id: &str, email: &str, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            email: email.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }
}
