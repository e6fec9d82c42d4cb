//! Error types for chatsync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding or assembling chatsync types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Channel id was not of the form `<type>:<id>`
    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),

    /// Event payload lacked a field its type requires
    #[error("{event_type} payload is missing `{field}`")]
    MissingField {
        /// Wire name of the event type
        event_type: String,
        /// Name of the missing field
        field: &'static str,
    },

    /// Event type cannot be turned into a domain event
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),

    /// JSON decoding failed
    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for TypesError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Error object sent by the backend, either on a closed connection or
/// in a failed API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("server error {code} ({status_code}): {message}")]
pub struct ServerError {
    /// Backend error code
    pub code: u32,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// HTTP status attached to the error
    #[serde(rename = "StatusCode", default)]
    pub status_code: u16,
}

impl ServerError {
    /// Error code sent when the session token has expired.
    pub const TOKEN_EXPIRED: u32 = 40;

    /// Range of codes that mean the session token is unusable.
    pub const INVALID_TOKEN_CODES: std::ops::RangeInclusive<u32> = 40..=43;

    /// Create a server error.
    pub fn new(code: u32, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            code,
            message: message.into(),
            status_code,
        }
    }

    /// The token expired and can be refreshed automatically.
    pub fn is_token_expired(&self) -> bool {
        self.code == Self::TOKEN_EXPIRED
    }

    /// The token was rejected (expired, malformed or revoked).
    pub fn is_invalid_token(&self) -> bool {
        Self::INVALID_TOKEN_CODES.contains(&self.code)
    }
}
