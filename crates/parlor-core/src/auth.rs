//! Token verification seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parlor_protocol::UserId;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing token")]
    MissingToken,

    /// Signature, format or claims are wrong.
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// The token is past its expiry.
    #[error("Token expired")]
    Expired,

    /// The token is too old to be refreshed.
    #[error("Token cannot be refreshed: {0}")]
    RefreshDenied(String),

    /// The verifier itself failed.
    #[error("Authentication unavailable: {0}")]
    Unavailable(String),
}

/// Identity carried by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when the token was refreshed; the client should switch to it.
    pub reissued_token: Option<String>,
}

/// Verifies bearer tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a token.
    ///
    /// Must return [`AuthError::Expired`] for a well-formed but expired token
    /// so the caller can try [`refresh_token`](Self::refresh_token).
    async fn verify_token(&self, token: &str) -> Result<Claims, AuthError>;

    /// Exchange an expired token for a fresh one.
    async fn refresh_token(&self, expired: &str) -> Result<Claims, AuthError>;
}
