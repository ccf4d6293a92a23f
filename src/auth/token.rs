//! HS256 session and device tokens carrying `{userId, exp}`

use crate::error::AuthError;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthClaims {
    pub user_id: i64,
    /// Expiry as seconds since the Unix epoch
    pub exp: i64,
}

impl AuthClaims {
    /// Claims for `user_id` expiring `ttl` from now. A `ttl` past the end of
    /// representable time is an issue error.
    pub fn expiring_in(user_id: i64, ttl: Duration) -> Result<Self, AuthError> {
        let exp = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| AuthError::Issue(format!("token lifetime of {}s is too long", ttl.as_secs())))?;
        Ok(Self {
            user_id,
            exp: exp.timestamp(),
        })
    }
}

pub fn sign(claims: &AuthClaims, key: &str) -> Result<String, AuthError> {
    let header = Header::new(Algorithm::HS256);
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(key.as_bytes()))
        .map_err(|e| AuthError::Issue(e.to_string()))
}

pub fn issue(user_id: i64, key: &str, ttl: Duration) -> Result<String, AuthError> {
    sign(&AuthClaims::expiring_in(user_id, ttl)?, key)
}

/// Check signature, algorithm and expiry. No clock leeway is granted.
pub fn verify(token: &str, key: &str) -> Result<AuthClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;

    jsonwebtoken::decode::<AuthClaims>(token, &DecodingKey::from_secret(key.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let token = issue(42, "secret", Duration::from_secs(60)).unwrap();
        let claims = verify(&token, "secret").unwrap();
        assert_eq!(claims.user_id, 42);
        assert!(claims.exp > chrono::Utc::now().timestamp());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = issue(42, "secret", Duration::from_secs(60)).unwrap();
        assert!(matches!(verify(&token, "other"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let claims = AuthClaims {
            user_id: 1,
            exp: chrono::Utc::now().timestamp() - 5,
        };
        let token = sign(&claims, "secret").unwrap();
        assert_eq!(verify(&token, "secret"), Err(AuthError::Expired));
    }

    #[test]
    fn test_huge_lifetime_is_an_issue_error() {
        let ttl = Duration::from_secs(100_000_000_000_000);
        assert!(matches!(issue(1, "secret", ttl), Err(AuthError::Issue(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(verify("not.a.token", "secret"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_claims_wire_names() {
        let json = serde_json::to_value(AuthClaims { user_id: 3, exp: 10 }).unwrap();
        assert_eq!(json, serde_json::json!({ "userId": 3, "exp": 10 }));
    }
}
