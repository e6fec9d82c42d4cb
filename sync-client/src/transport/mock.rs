//! Mock transport for testing.
//!
//! Records connect and disconnect calls, lets tests inject events and
//! failures, and by default plays a successful handshake on `connect()`.

use super::{ConnectEndpoint, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use chatsync_core::DisconnectionSource;
use chatsync_types::{Event, SessionId};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Mock transport for testing.
///
/// On `connect()` it emits `Connecting`, `Opened` and, unless
/// [`hold_session_id`](Self::hold_session_id) was called, a
/// `SessionAssigned` with a fresh id. `disconnect()` only records the
/// call; [`drop_connection`](Self::drop_connection) simulates a drop.
#[derive(Debug)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    endpoint: Option<ConnectEndpoint>,
    connect_calls: usize,
    disconnect_calls: Vec<DisconnectionSource>,
    sessions_issued: usize,
    hold_session_id: bool,
    fail_next_connect: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner::default())),
            events,
        }
    }

    /// Don't assign a session id on connect; tests call
    /// [`assign_session`](Self::assign_session) themselves.
    pub fn hold_session_id(&self) {
        self.inner.lock().unwrap().hold_session_id = true;
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_connect = Some(error.to_string());
    }

    /// Emit a session id, as the server would.
    pub fn assign_session(&self, session_id: &str) {
        self.emit(TransportEvent::SessionAssigned(SessionId::new(session_id)));
    }

    /// Emit received events.
    pub fn receive(&self, events: Vec<Event>) {
        self.emit(TransportEvent::Received(events));
    }

    /// Drop the connection from the far side.
    pub fn drop_connection(&self, source: DisconnectionSource) {
        self.inner.lock().unwrap().connected = false;
        self.emit(TransportEvent::Closed(source));
    }

    /// Emit an arbitrary transport event.
    pub fn emit(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Number of connect() calls.
    pub fn connect_calls(&self) -> usize {
        self.inner.lock().unwrap().connect_calls
    }

    /// Sources passed to disconnect(), in call order.
    pub fn disconnect_calls(&self) -> Vec<DisconnectionSource> {
        self.inner.lock().unwrap().disconnect_calls.clone()
    }

    /// Whether the mock considers itself connected.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_connect_endpoint(&self, endpoint: ConnectEndpoint) {
        self.inner.lock().unwrap().endpoint = Some(endpoint);
    }

    fn connect_endpoint(&self) -> Option<ConnectEndpoint> {
        self.inner.lock().unwrap().endpoint.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner.connect_calls += 1;

            // Check for forced failure
            if let Some(error) = inner.fail_next_connect.take() {
                return Err(TransportError::ConnectionFailed(error));
            }
            if inner.endpoint.is_none() {
                return Err(TransportError::MissingEndpoint);
            }

            inner.connected = true;
            if inner.hold_session_id {
                None
            } else {
                inner.sessions_issued += 1;
                Some(SessionId::new(format!("session-{}", inner.sessions_issued)))
            }
        };

        self.emit(TransportEvent::Connecting);
        self.emit(TransportEvent::Opened);
        if let Some(session_id) = session {
            self.emit(TransportEvent::SessionAssigned(session_id));
        }
        Ok(())
    }

    async fn disconnect(&self, source: DisconnectionSource) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.disconnect_calls.push(source);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Token;

    fn endpoint() -> ConnectEndpoint {
        ConnectEndpoint {
            base_url: "wss://chat.example.com".into(),
            api_key: "key".into(),
            user_id: "alice".into(),
            user_name: None,
            token: Token::new("secret", "alice".into()),
        }
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_plays_handshake() {
        let transport = MockTransport::new();
        let mut events = transport.subscribe();
        transport.set_connect_endpoint(endpoint());

        transport.connect().await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connecting);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Opened);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::SessionAssigned(SessionId::new("session-1"))
        );
    }

    #[tokio::test]
    async fn held_session_id_is_not_assigned() {
        let transport = MockTransport::new();
        let mut events = transport.subscribe();
        transport.set_connect_endpoint(endpoint());
        transport.hold_session_id();

        transport.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connecting);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Opened);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn mock_transport_disconnect_records_source() {
        let transport = MockTransport::new();
        let mut events = transport.subscribe();
        transport.set_connect_endpoint(endpoint());
        transport.connect().await.unwrap();

        transport
            .disconnect(DisconnectionSource::UserInitiated)
            .await
            .unwrap();

        assert!(!transport.is_connected());
        assert_eq!(
            transport.disconnect_calls(),
            vec![DisconnectionSource::UserInitiated]
        );
        // Requested closures are not echoed as events
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(TransportEvent::SessionAssigned(SessionId::new("session-1")))
        );
    }

    #[tokio::test]
    async fn dropped_connection_is_reported() {
        let transport = MockTransport::new();
        let mut events = transport.subscribe();
        transport.drop_connection(DisconnectionSource::NoPongReceived);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Closed(DisconnectionSource::NoPongReceived)
        );
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn connect_without_endpoint_fails() {
        let transport = MockTransport::new();
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::MissingEndpoint)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.set_connect_endpoint(endpoint());
        transport.fail_next_connect("network unreachable");

        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());

        // Failure is one-shot
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.connect_calls(), 2);
    }
}
