//! Bearer-token validation (C6 auth boundary).
//!
//! Tokens are issued by the external auth endpoint; the relay only validates.
//! Both the cryptographic validity and the `exp` claim are enforced, and the
//! token subject must match the user id the connection claims — a valid token
//! for a different user is still an authentication failure. All failures
//! collapse into one generic error; the sub-reason is never revealed.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::directory::UserId;
use crate::error::RelayError;

/// Claims carried by a relay bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id, stringified.
    pub sub: String,
    pub username: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl JwtService {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        validation.validate_aud = false;
        // A token whose exp equals "now" is already expired.
        validation.leeway = 0;

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation,
        }
    }

    /// Validate and decode a token.
    pub fn validate_token(&self, token: &str) -> Result<TokenClaims, RelayError> {
        decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                warn!("token validation failed: {}", e);
                RelayError::Authentication
            })
    }

    /// Validate a token AND check that its subject is `claimed_user_id`.
    ///
    /// This is the handshake gate: a valid token for user A presented by a
    /// connection claiming to be user B is rejected.
    pub fn authorize(
        &self,
        token: &str,
        claimed_user_id: UserId,
    ) -> Result<TokenClaims, RelayError> {
        let claims = self.validate_token(token)?;
        let subject: UserId = claims
            .sub
            .parse()
            .map_err(|_| RelayError::Authentication)?;
        if subject != claimed_user_id {
            warn!(
                subject,
                claimed = claimed_user_id,
                "token subject does not match claimed user id"
            );
            return Err(RelayError::Authentication);
        }
        Ok(claims)
    }

    /// Mint a token. The production issuer is the external auth endpoint;
    /// this exists for integration tests and dev seeding.
    pub fn issue_token(
        &self,
        user_id: UserId,
        username: &str,
        ttl: chrono::Duration,
    ) -> Result<String, RelayError> {
        let now = chrono::Utc::now();
        let claims = TokenClaims {
            sub: user_id.to_string(),
            username: username.to_string(),
            exp: (now + ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| RelayError::Internal(format!("token encoding failed: {e}")))
    }
}
