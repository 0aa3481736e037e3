use crate::clock::{SharedClock, from_unix_seconds, unix_seconds};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const TOKEN_VALIDITY: Duration = Duration::from_secs(3 * 60);
const MAX_FUTURE_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityClaims {
    pub user_id: i64,
    pub issued_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireClaims {
    user_id: String,
    iat: u64,
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    clock: SharedClock,
}

impl TokenService {
    pub fn new(secret: &str, clock: SharedClock) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Validity is derived from `iat` below, never from a claim the client controls.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            clock,
        }
    }

    pub fn issue(&self, user_id: i64) -> Result<String, TokenError> {
        let claims = WireClaims {
            user_id: user_id.to_string(),
            iat: unix_seconds(self.clock.now()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(TokenError::Signing)
    }

    pub fn verify(&self, token: &str) -> Result<IdentityClaims, TokenError> {
        let data = decode::<WireClaims>(token.trim(), &self.decoding_key, &self.validation)
            .map_err(|_| TokenError::Invalid)?;
        let user_id = data
            .claims
            .user_id
            .parse::<i64>()
            .map_err(|_| TokenError::Invalid)?;
        let issued_at = from_unix_seconds(data.claims.iat);
        let now = self.clock.now();
        if issued_at > now + MAX_FUTURE_SKEW {
            return Err(TokenError::Invalid);
        }
        if now > issued_at + TOKEN_VALIDITY {
            return Err(TokenError::Expired);
        }
        Ok(IdentityClaims {
            user_id,
            issued_at: data.claims.iat,
        })
    }
}
