//! Stateless access tokens (HS256 JWT).
//!
//! Tokens carry `{sub, iat, exp, typ: "access"}` and are not revocable
//! before expiry; there is no server-side session state and no refresh
//! mechanism. A compromised token is bounded only by its TTL.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use linkbook_common::{Error, Result};
use serde::{Deserialize, Serialize};

const TOKEN_TYPE_ACCESS: &str = "access";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
    typ: String,
}

/// Issues and validates access tokens with a process-wide signing key.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn issue(&self, subject: i64) -> Result<String> {
        self.issue_with_ttl(subject, self.ttl_secs)
    }

    pub fn issue_with_ttl(&self, subject: i64, ttl_secs: i64) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + ttl_secs,
            typ: TOKEN_TYPE_ACCESS.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token signing failed: {}", e)))
    }

    /// Returns the subject user id, or `InvalidToken` / `TokenExpired`.
    pub fn validate(&self, token: &str) -> Result<i64> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::TokenExpired,
                _ => Error::InvalidToken,
            }
        })?;

        if data.claims.typ != TOKEN_TYPE_ACCESS {
            return Err(Error::InvalidToken);
        }
        data.claims.sub.parse::<i64>().map_err(|_| Error::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let svc = TokenService::new("test-secret", 3600);
        let token = svc.issue(42).unwrap();
        assert_eq!(svc.validate(&token).unwrap(), 42);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let svc = TokenService::new("secret-a", 3600);
        let other = TokenService::new("secret-b", 3600);
        let token = svc.issue(1).unwrap();
        assert!(matches!(other.validate(&token), Err(Error::InvalidToken)));
    }

    #[test]
    fn test_expired_token() {
        let svc = TokenService::new("test-secret", 3600);
        let token = svc.issue_with_ttl(1, -120).unwrap();
        assert!(matches!(svc.validate(&token), Err(Error::TokenExpired)));
    }

    #[test]
    fn test_garbage_rejected() {
        let svc = TokenService::new("test-secret", 3600);
        assert!(matches!(svc.validate("not.a.jwt"), Err(Error::InvalidToken)));
        assert!(matches!(svc.validate(""), Err(Error::InvalidToken)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        // A token signed with the right key but the wrong typ claim.
        let svc = TokenService::new("test-secret", 3600);
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "1".to_string(),
            iat: now,
            exp: now + 600,
            typ: "refresh".to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(svc.validate(&token), Err(Error::InvalidToken)));
    }
}
