//! REST API abstraction for chatsync.
//!
//! Remote requests are described as [`Endpoint`] values and executed by an
//! [`ApiClient`]. Requests issued while the connection is recovering go
//! through [`ApiClient::recovery_request`], which the client executes ahead
//! of its regular queue.

mod mock;

pub use mock::{MockApiClient, RecordedRequest};

use async_trait::async_trait;
use chatsync_core::{ListQuery, PaginationParameter};
use chatsync_types::{
    ChannelId, ChannelPayload, EventPayload, MessageId, MessagePayload, ServerError, UserPayload,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::credentials::UserInfo;

/// API errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The backend answered with an error object.
    #[error(transparent)]
    Server(ServerError),

    /// The request did not reach the backend.
    #[error("network error: {0}")]
    Network(String),

    /// The response body had an unexpected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The request was flushed from the queue before it ran.
    #[error("request cancelled")]
    Cancelled,
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

/// A remote request.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// HTTP method
    pub method: Method,
    /// Path below the API base URL
    pub path: String,
    /// Query string parameters
    pub query: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
    /// Must be attributed to the live connection
    pub requires_session: bool,
}

impl Endpoint {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_session: false,
        }
    }

    /// One page of a channel list query.
    pub fn query_channels(query: &ListQuery, offset: usize, limit: usize) -> Self {
        let mut endpoint = Self::new(Method::Post, "channels");
        endpoint.body = Some(json!({
            "filter_conditions": query.filter,
            "sort": [{ "field": query.sort.key, "direction": query.sort.direction }],
            "limit": limit,
            "offset": offset,
            "watch": true,
            "state": true,
        }));
        endpoint.requires_session = true;
        endpoint
    }

    /// Specific channels by id.
    pub fn channels_by_id(cids: &[ChannelId]) -> Self {
        let ids: Vec<String> = cids.iter().map(ToString::to_string).collect();
        let mut endpoint = Self::new(Method::Post, "channels");
        endpoint.body = Some(json!({
            "filter_conditions": { "cid": { "$in": ids } },
            "limit": cids.len(),
            "state": true,
        }));
        endpoint
    }

    /// One page of channel messages.
    pub fn messages(
        cid: &ChannelId,
        pagination: Option<&PaginationParameter<MessageId>>,
        limit: usize,
    ) -> Self {
        let mut endpoint = Self::new(
            Method::Get,
            format!("channels/{}/{}/messages", cid.kind(), cid.id()),
        );
        endpoint.query.push(("limit".into(), limit.to_string()));
        if let Some(pagination) = pagination {
            let key = match pagination {
                PaginationParameter::LessThan(_) => "id_lt",
                PaginationParameter::LessThanOrEqual(_) => "id_lte",
                PaginationParameter::GreaterThan(_) => "id_gt",
                PaginationParameter::GreaterThanOrEqual(_) => "id_gte",
                PaginationParameter::Around(_) => "id_around",
            };
            endpoint
                .query
                .push((key.into(), pagination.anchor().to_string()));
        }
        endpoint
    }

    /// Events missed since `last_sync_at` for the given channels.
    pub fn missing_events(last_sync_at: u64, cids: &[ChannelId]) -> Self {
        let ids: Vec<String> = cids.iter().map(ToString::to_string).collect();
        let mut endpoint = Self::new(Method::Post, "sync");
        endpoint.body = Some(json!({
            "last_sync_at": last_sync_at,
            "channel_cids": ids,
        }));
        endpoint
    }

    /// Guest user token.
    pub fn guest_token(user: &UserInfo) -> Self {
        let mut endpoint = Self::new(Method::Post, "guest");
        endpoint.body = Some(json!({
            "user": { "id": user.id, "name": user.name },
        }));
        endpoint
    }
}

/// Channel with its latest messages, as returned by channel queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Channel data
    pub channel: ChannelPayload,
    /// Latest messages, oldest first
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

/// Response of channel queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelListResponse {
    /// Matching channels in query order
    pub channels: Vec<ChannelState>,
}

/// Response of message queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Messages, oldest first
    pub messages: Vec<MessagePayload>,
}

/// Response of the missing-events endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingEventsResponse {
    /// Missed events, oldest first
    pub events: Vec<EventPayload>,
}

/// Response of the guest token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTokenResponse {
    /// Session token
    pub access_token: String,
    /// Created guest user
    pub user: UserPayload,
}

/// Decode a JSON response body.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

/// REST API client.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
    /// Execute a request through the regular queue.
    async fn request(&self, endpoint: Endpoint) -> Result<Value, ApiError>;

    /// Execute a request while recovering the connection.
    async fn recovery_request(&self, endpoint: Endpoint) -> Result<Value, ApiError>;

    /// Fail every queued request with [`ApiError::Cancelled`].
    fn flush_requests_queue(&self);
}
