// Error handling module
// Defines the client error taxonomy and the human-readable message chain

use serde_json::Value;
use thiserror::Error;

/// Fallback shown when neither the body nor the transport explains a failure
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred.";

/// Message used when no refresh token is available or the backend rejected it
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please log in again.";

/// Errors surfaced by the client
///
/// `Clone` because a single refresh failure rejects every request queued
/// behind it.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The request never produced an HTTP response
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-success status
    #[error("API error: {status} - {message}")]
    Api {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    /// No usable refresh token, or the backend rejected it
    #[error("{0}")]
    SessionExpired(String),

    /// The persistent token store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Authentication,
    Validation,
    Server,
    SessionExpired,
    Other,
}

impl ClientError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(_) => ErrorKind::Network,
            ClientError::Api { status: 401, .. } => ErrorKind::Authentication,
            ClientError::Api { status, .. } if (400..500).contains(status) => {
                ErrorKind::Validation
            }
            ClientError::Api { status, .. } if *status >= 500 => ErrorKind::Server,
            ClientError::SessionExpired(_) => ErrorKind::SessionExpired,
            _ => ErrorKind::Other,
        }
    }

    /// HTTP status if the backend produced one
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message suitable for showing to a person
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Api { message, .. } => message.clone(),
            ClientError::SessionExpired(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };
        ClientError::Transport(format!("{} (kind: {})", e, kind))
    }
}

impl From<rusqlite::Error> for ClientError {
    fn from(e: rusqlite::Error) -> Self {
        ClientError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(e: anyhow::Error) -> Self {
        ClientError::Internal(format!("{:#}", e))
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Derive a readable message from an error response body
///
/// Order: `detail` field, then flattened field errors, then the transport
/// message, then [`UNKNOWN_ERROR_MESSAGE`].
pub fn describe_error(body: Option<&Value>, transport_message: Option<&str>) -> String {
    if let Some(detail) = body.and_then(|b| b.get("detail")).and_then(value_text) {
        if !detail.is_empty() {
            return detail;
        }
    }

    if let Some(Value::Object(fields)) = body {
        let flattened = fields
            .iter()
            .map(|(field, value)| format!("{}: {}", field.replace('_', " "), flatten_value(value)))
            .collect::<Vec<_>>()
            .join("; ");
        if !flattened.is_empty() {
            return flattened;
        }
    }

    match transport_message {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => UNKNOWN_ERROR_MESSAGE.to_string(),
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| value_text(item).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(", "),
        other => value_text(other).unwrap_or_default(),
    }
}
