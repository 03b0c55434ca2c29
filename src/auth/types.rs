// Authentication types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which persisted entry a token-store operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
    User,
}

impl TokenKind {
    pub const ALL: [TokenKind; 3] = [TokenKind::Access, TokenKind::Refresh, TokenKind::User];

    /// Fixed storage key
    pub fn key(self) -> &'static str {
        match self {
            TokenKind::Access => "accessToken",
            TokenKind::Refresh => "refreshToken",
            TokenKind::User => "user",
        }
    }

    pub fn from_key(key: &str) -> Option<TokenKind> {
        TokenKind::ALL.into_iter().find(|kind| kind.key() == key)
    }
}

/// Cached identity of the logged-in user
///
/// Fields the backend sends that are not modelled here survive a round trip
/// through storage in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    /// Identity carrying only a username
    pub fn from_username(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }
}

/// Everything the token store holds, read or written as one unit
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

/// One field of a session update
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Patch<T> {
    /// Leave the previous value in place
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    /// `Some` sets, `None` keeps
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Keep,
        }
    }

    /// Resolve against the previous value
    pub fn apply(self, previous: Option<T>) -> Option<T> {
        match self {
            Patch::Keep => previous,
            Patch::Set(v) => Some(v),
            Patch::Clear => None,
        }
    }
}

/// Partial update to the session; omitted fields keep their value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionUpdate {
    pub access_token: Patch<String>,
    pub refresh_token: Patch<String>,
    pub user: Patch<User>,
}

impl SessionUpdate {
    /// Update that clears everything
    pub fn cleared() -> Self {
        Self {
            access_token: Patch::Clear,
            refresh_token: Patch::Clear,
            user: Patch::Clear,
        }
    }

    pub fn apply(self, previous: StoredSession) -> StoredSession {
        StoredSession {
            access_token: self.access_token.apply(previous.access_token),
            refresh_token: self.refresh_token.apply(previous.refresh_token),
            user: self.user.apply(previous.user),
        }
    }
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Login response body
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    #[serde(default)]
    pub user: Option<User>,
}

/// Body shared by the refresh and blacklist endpoints
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh response; `refresh` is present only when the backend rotates it
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Verify request body
#[derive(Serialize)]
pub struct VerifyRequest<'a> {
    pub token: &'a str,
}
