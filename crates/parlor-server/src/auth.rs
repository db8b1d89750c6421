//! HS256 bearer tokens.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parlor_core::{AuthError, Authenticator, Claims};
use parlor_protocol::UserId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthConfig;

/// Payload of a Parlor token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Username.
    pub sub: String,
    pub uid: UserId,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies HS256 tokens.
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    refresh_validation: Validation,
    ttl: Duration,
    refresh_window: Duration,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("ttl", &self.ttl)
            .field("refresh_window", &self.refresh_window)
            .finish_non_exhaustive()
    }
}

/// Longest lifetime or refresh window accepted from configuration.
const MAX_SECS: i64 = 100 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(MAX_SECS).min(MAX_SECS))
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;

        let mut refresh_validation = Validation::new(Algorithm::HS256);
        refresh_validation.validate_exp = false;

        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            refresh_validation,
            ttl: seconds(config.token_ttl_secs),
            refresh_window: seconds(config.refresh_window_secs),
        }
    }

    /// Issue a token for a user, valid for the configured lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unavailable`] if signing fails.
    pub fn issue(&self, user_id: UserId, username: &str) -> Result<String, AuthError> {
        self.issue_at(user_id, username, Utc::now())
    }

    fn issue_at(
        &self,
        user_id: UserId,
        username: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = TokenClaims {
            sub: username.to_string(),
            uid: user_id,
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Unavailable(e.to_string()))
    }

    fn decode(&self, token: &str, validation: &Validation) -> Result<TokenClaims, AuthError> {
        decode::<TokenClaims>(token, &self.decoding_key, validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::Invalid("bad signature".to_string()),
                _ => AuthError::Invalid(e.to_string()),
            })
    }
}

impl From<TokenClaims> for Claims {
    fn from(claims: TokenClaims) -> Self {
        Self {
            user_id: claims.uid,
            username: claims.sub,
            expires_at: DateTime::from_timestamp(claims.exp, 0),
            reissued_token: None,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(self.decode(token, &self.validation)?.into())
    }

    async fn refresh_token(&self, expired: &str) -> Result<Claims, AuthError> {
        let claims = self.decode(expired, &self.refresh_validation)?;
        let now = Utc::now();
        let expired_for = now.timestamp() - claims.exp;
        if expired_for > self.refresh_window.num_seconds() {
            return Err(AuthError::RefreshDenied(format!(
                "expired {expired_for}s ago"
            )));
        }

        let token = self.issue_at(claims.uid, &claims.sub, now)?;
        debug!(user_id = claims.uid, expired_for, "Token reissued");
        let mut refreshed = Claims::from(claims);
        refreshed.expires_at = Some(now + self.ttl);
        refreshed.reissued_token = Some(token);
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new(&AuthConfig {
            jwt_secret: "test-secret".into(),
            token_ttl_secs: 3600,
            leeway_secs: 0,
            refresh_window_secs: 600,
        })
    }

    #[tokio::test]
    async fn test_issued_token_verifies() {
        let auth = authenticator();
        let token = auth.issue(7, "alice").unwrap();

        let claims = auth.verify_token(&token).await.unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.username, "alice");
        assert!(claims.expires_at.unwrap() > Utc::now());
        assert!(claims.reissued_token.is_none());
    }

    #[tokio::test]
    async fn test_foreign_secret_is_invalid() {
        let other = JwtAuthenticator::new(&AuthConfig {
            jwt_secret: "other-secret".into(),
            ..AuthConfig::default()
        });
        let token = other.issue(7, "alice").unwrap();

        let result = authenticator().verify_token(&token).await;
        assert!(matches!(result, Err(AuthError::Invalid(_))));
        assert!(matches!(
            authenticator().verify_token("garbage").await,
            Err(AuthError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_within_window() {
        let auth = authenticator();
        let token = auth
            .issue_at(7, "alice", Utc::now() - Duration::seconds(3660))
            .unwrap();

        assert!(matches!(auth.verify_token(&token).await, Err(AuthError::Expired)));

        let refreshed = auth.refresh_token(&token).await.unwrap();
        assert_eq!(refreshed.user_id, 7);
        let reissued = refreshed.reissued_token.unwrap();
        assert_eq!(auth.verify_token(&reissued).await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_refresh_denied_past_window() {
        let auth = authenticator();
        let token = auth
            .issue_at(7, "alice", Utc::now() - Duration::hours(2))
            .unwrap();

        assert!(matches!(
            auth.refresh_token(&token).await,
            Err(AuthError::RefreshDenied(_))
        ));
    }
}
