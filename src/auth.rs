// Session and password primitives.
//
// Sessions are short-lived HS256 tokens carrying {sub, exp}, issued by the
// API as an HTTP-only cookie. The bridge validates the same token with the
// shared secret and never touches the users table — signature validity is
// sufficient there.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::constants::ACCESS_TOKEN_EXPIRE_HOURS;
use crate::error::{OtError, Result};

pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| OtError::Internal(format!("bcrypt hash failed: {}", e)))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn create_access_token(username: &str, secret: &str) -> Result<String> {
    let exp = Utc::now()
        .checked_add_signed(chrono::Duration::hours(ACCESS_TOKEN_EXPIRE_HOURS))
        .ok_or_else(|| OtError::Internal("clock overflow".to_string()))?
        .timestamp() as usize;
    let claims = Claims {
        sub: username.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| OtError::Internal(format!("token encode failed: {}", e)))
}

/// Validate a token and return its subject. None for anything invalid or
/// expired — callers translate to 401.
pub fn decode_access_token(token: &str, secret: &str) -> Option<String> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some(data.claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn test_token_round_trip() {
        let token = create_access_token("casey", "secret").unwrap();
        assert_eq!(decode_access_token(&token, "secret").as_deref(), Some("casey"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = create_access_token("casey", "secret").unwrap();
        assert!(decode_access_token(&token, "other-secret").is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let claims = Claims {
            sub: "casey".to_string(),
            exp: (Utc::now().timestamp() - 3600) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(decode_access_token(&token, "secret").is_none());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(decode_access_token("not.a.token", "secret").is_none());
    }
}
