//! Error types for sync-client.

use chatsync_core::CursorError;
use chatsync_types::{ServerError, TypesError};
use thiserror::Error;

use crate::api::ApiError;
use crate::credentials::TokenError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors that can occur in client operations.
///
/// Errors are `Clone` because a single failure is often delivered to
/// several waiters at once.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Operation requires active mode.
    #[error("client is not in active mode")]
    NotActive,

    /// The client was dropped while the operation was pending.
    #[error("client was dropped before the operation completed")]
    Deallocated,

    /// The operation was cancelled (disconnect or principal switch).
    #[error("operation cancelled")]
    Cancelled,

    /// No session id arrived within the timeout.
    #[error("timed out waiting for a session id")]
    WaiterTimeout,

    /// No token provider is configured.
    #[error("no token provider configured")]
    MissingTokenProvider,

    /// Fetching a new token failed.
    #[error("credential refresh failed: {0}")]
    CredentialRefreshFailed(#[source] TokenError),

    /// The connection attempt ended without a session id.
    #[error("connection was not successful{}", .error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    ConnectionNotSuccessful {
        /// Error reported by the server, if any.
        error: Option<ServerError>,
    },

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// API error.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Pagination brackets did not match.
    #[error(transparent)]
    Cursor(#[from] CursorError),

    /// Response or event could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] TypesError),
}

impl ClientError {
    /// Server error carried by this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::ConnectionNotSuccessful { error } => error.as_ref(),
            Self::Api(ApiError::Server(error)) => Some(error),
            Self::CredentialRefreshFailed(TokenError::Api(ApiError::Server(error))) => Some(error),
            _ => None,
        }
    }
}
