//! Transport abstraction for chatsync.
//!
//! This module provides a pluggable realtime transport that abstracts the
//! underlying connection mechanism (WebSocket in production, mock for
//! testing).
//!
//! # Design
//!
//! The transport is driven by the connection coordinator:
//! - `set_connect_endpoint()` tells it where and as whom to connect
//! - `connect()` starts connecting
//! - `disconnect()` closes the connection and returns once it is closed
//! - `subscribe()` streams lifecycle changes and received events
//!
//! The transport may reconnect on its own after a system-initiated drop;
//! it reports that through [`TransportEvent::Connecting`]. Closures that
//! the coordinator asked for are confirmed by `disconnect()` returning and
//! are not reported again as [`TransportEvent::Closed`].

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use chatsync_core::DisconnectionSource;
use chatsync_types::{Event, SessionId, UserId};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::credentials::Token;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// `connect()` was called before an endpoint was set.
    #[error("no connect endpoint configured")]
    MissingEndpoint,

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Where and as whom the transport connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectEndpoint {
    /// Realtime endpoint URL
    pub base_url: String,
    /// Application key
    pub api_key: String,
    /// Connecting user
    pub user_id: UserId,
    /// Display name sent with the connect request
    pub user_name: Option<String>,
    /// Session token
    pub token: Token,
}

/// Lifecycle changes and data reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Started connecting (first attempt or automatic reconnect).
    Connecting,
    /// Connection is open.
    Opened,
    /// Server assigned a session id.
    SessionAssigned(SessionId),
    /// Connection closed without being asked to.
    Closed(DisconnectionSource),
    /// Events received, in arrival order.
    Received(Vec<Event>),
}

/// Realtime transport.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Set the endpoint used by the next `connect()`.
    fn set_connect_endpoint(&self, endpoint: ConnectEndpoint);

    /// Endpoint currently configured.
    fn connect_endpoint(&self) -> Option<ConnectEndpoint>;

    /// Start connecting.
    ///
    /// Returns once the attempt is under way; progress is reported
    /// through [`subscribe`](Self::subscribe).
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection, returning once it is closed.
    ///
    /// No [`TransportEvent::Closed`] is emitted for this closure.
    async fn disconnect(&self, source: DisconnectionSource) -> Result<(), TransportError>;

    /// Subscribe to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
