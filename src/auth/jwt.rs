//! Token verification
//! Mission: verify signature and expiry on bearer tokens issued upstream.
//! Issuance is out of scope — this handler only validates.

use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::auth::models::Claims;
use crate::error::ApiError;

pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Absence of a token is the caller's concern (401); this only
    /// distinguishes a malformed/expired token (403) from a server-side
    /// misconfiguration (500, e.g. an empty secret).
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        if self.secret.is_empty() {
            return Err(ApiError::Internal("jwt secret not configured".into()));
        }
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|_| ApiError::Forbidden("invalid or expired token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(secret: &str, claims: &Claims) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims(exp_offset_secs: i64) -> Claims {
        Claims {
            sub: "user-1".into(),
            username: "trader1".into(),
            role: "trader".into(),
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        }
    }

    #[test]
    fn validates_well_formed_token() {
        let handler = JwtHandler::new("test-secret".into());
        let token = token_for("test-secret", &claims(3600));
        let decoded = handler.validate_token(&token).unwrap();
        assert_eq!(decoded.username, "trader1");
    }

    #[test]
    fn rejects_token_signed_with_different_secret() {
        let handler = JwtHandler::new("real-secret".into());
        let token = token_for("wrong-secret", &claims(3600));
        assert!(handler.validate_token(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let handler = JwtHandler::new("test-secret".into());
        let token = token_for("test-secret", &claims(-10));
        assert!(handler.validate_token(&token).is_err());
    }

    #[test]
    fn empty_secret_is_a_configuration_error_not_a_rejection() {
        let handler = JwtHandler::new(String::new());
        let token = token_for("test-secret", &claims(3600));
        let err = handler.validate_token(&token).unwrap_err();
        matches!(err, ApiError::Internal(_));
    }
}
