// Unverified JWT payload decoding
//
// Only used to label the session (username, expiry for logs). The signature
// is never checked here; the backend stays the authority on validity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::types::User;

/// Claims of interest from an access token
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessClaims {
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl AccessClaims {
    /// Decode the payload segment of `token`, or `None` if it is not a JWT
    pub fn decode(token: &str) -> Option<Self> {
        let mut segments = token.split('.');
        let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
        if segments.next().is_some() {
            return None;
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }

    /// Identity derived from the claims, if they name a user
    pub fn user(&self) -> Option<User> {
        let username = self.username.clone()?;
        Some(User {
            id: self.user_id.clone(),
            ..User::from_username(username)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_token(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{}.{}.signature", header, body)
    }

    #[test]
    fn test_decode_simplejwt_payload() {
        let token = make_token(json!({
            "token_type": "access",
            "exp": 1_760_000_000,
            "user_id": 3,
            "username": "alice"
        }));
        let claims = AccessClaims::decode(&token).unwrap();
        assert_eq!(claims.username.as_deref(), Some("alice"));
        assert_eq!(
            claims.expires_at().unwrap().to_rfc3339(),
            "2025-10-09T08:53:20+00:00"
        );

        let user = claims.user().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.id, Some(json!(3)));
    }

    #[test]
    fn test_opaque_tokens_do_not_decode() {
        assert!(AccessClaims::decode("A1").is_none());
        assert!(AccessClaims::decode("a.b").is_none());
        assert!(AccessClaims::decode("a.!!!.c").is_none());
        assert!(AccessClaims::decode("a.b.c.d").is_none());
    }

    #[test]
    fn test_claims_without_username_give_no_user() {
        let token = make_token(json!({"user_id": 9}));
        let claims = AccessClaims::decode(&token).unwrap();
        assert!(claims.user().is_none());
    }
}
