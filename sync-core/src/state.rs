//! Connection state machine for chatsync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! realtime connection lifecycle. The state machine takes events as input
//! and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (opening the socket, completing waiters, refreshing the
//! token) is performed by sync-client, not by this module.

use chatsync_types::{ServerError, SessionId};

/// Why the connection went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectionSource {
    /// No connection has been made yet.
    NotYetConnected,
    /// The application asked to disconnect.
    UserInitiated,
    /// The platform or network dropped the connection.
    SystemInitiated,
    /// The server stopped answering keep-alives.
    NoPongReceived,
    /// The server closed the connection, optionally with an error.
    ServerInitiated(Option<ServerError>),
}

impl DisconnectionSource {
    /// Server error attached to the disconnection, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::ServerInitiated(error) => error.as_ref(),
            _ => None,
        }
    }
}

/// Connection status exposed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection was attempted yet.
    Initialized,
    /// Connecting, or reconnecting after a recoverable drop.
    Connecting,
    /// Connected with a session id.
    Connected,
    /// Disconnect requested, waiting for the transport to confirm.
    Disconnecting,
    /// Disconnected; `error` is set when the server caused it.
    Disconnected {
        /// Error reported by the server.
        error: Option<ServerError>,
    },
}

impl ConnectionStatus {
    /// Status shown for a connection that went down for `source`.
    ///
    /// Drops the client recovers from on its own (network, missed pongs,
    /// expired token) read as `Connecting`; the rest read as `Disconnected`.
    pub fn for_disconnection(source: &DisconnectionSource) -> Self {
        match source {
            DisconnectionSource::SystemInitiated | DisconnectionSource::NoPongReceived => {
                Self::Connecting
            }
            DisconnectionSource::ServerInitiated(Some(error)) if error.is_token_expired() => {
                Self::Connecting
            }
            DisconnectionSource::ServerInitiated(error) => Self::Disconnected {
                error: error.clone(),
            },
            DisconnectionSource::NotYetConnected | DisconnectionSource::UserInitiated => {
                Self::Disconnected { error: None }
            }
        }
    }
}

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected {
        /// Why the connection is down.
        source: DisconnectionSource,
    },
    /// Transport connection attempt in progress.
    Connecting,
    /// Transport is open, server has not assigned a session id yet.
    WaitingForSessionId,
    /// Fully connected.
    Connected {
        /// Session id assigned by the server.
        session_id: SessionId,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected {
            source: DisconnectionSource::NotYetConnected,
        }
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected { .. }, Event::ConnectRequested) => (
                Self::Connecting,
                vec![Action::Connect, Action::EmitStatus(ConnectionStatus::Connecting)],
            ),
            (Self::Disconnected { .. }, Event::TransportConnecting) => (
                Self::Connecting,
                vec![Action::EmitStatus(ConnectionStatus::Connecting)],
            ),
            (Self::Disconnected { .. }, Event::Disconnected { source }) => {
                (Self::Disconnected { source }, vec![])
            }

            // From Connecting
            (Self::Connecting, Event::TransportOpened) => (Self::WaitingForSessionId, vec![]),

            // Session id can arrive with the open frame or after it
            (Self::Connecting | Self::WaitingForSessionId, Event::SessionAssigned { session_id }) => (
                Self::Connected {
                    session_id: session_id.clone(),
                },
                vec![
                    Action::CompleteWaiters(WaiterOutcome::Session(session_id)),
                    Action::EmitStatus(ConnectionStatus::Connected),
                ],
            ),
            (Self::Connecting | Self::WaitingForSessionId, Event::ConnectFailed { error }) => (
                Self::Disconnected {
                    source: DisconnectionSource::ServerInitiated(error.clone()),
                },
                vec![
                    Action::CompleteWaiters(WaiterOutcome::Failed(error.clone())),
                    Action::EmitStatus(ConnectionStatus::Disconnected { error }),
                ],
            ),

            // From Connected
            (Self::Connected { session_id: current }, Event::SessionAssigned { session_id }) => {
                if current == session_id {
                    (Self::Connected { session_id: current }, vec![])
                } else {
                    (
                        Self::Connected {
                            session_id: session_id.clone(),
                        },
                        vec![Action::CompleteWaiters(WaiterOutcome::Session(session_id))],
                    )
                }
            }
            (state @ Self::Connected { .. }, Event::DisconnectRequested { source }) => (
                state,
                vec![
                    Action::Disconnect { source },
                    Action::EmitStatus(ConnectionStatus::Disconnecting),
                ],
            ),

            // Any live state can go down
            (
                Self::Connecting | Self::WaitingForSessionId | Self::Connected { .. },
                Event::Disconnected { source },
            ) => {
                let actions = disconnection_actions(&source);
                (Self::Disconnected { source }, actions)
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::WaitingForSessionId)
    }

    /// Session id, when connected.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Connected { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// Status this state maps to.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected { source } => ConnectionStatus::for_disconnection(source),
            Self::Connecting | Self::WaitingForSessionId => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Actions that follow a live connection going down.
///
/// An expired token never resolves session waiters: they stay pending
/// across the automatic refresh and reconnect. Every other cause resolves
/// them with a failure.
fn disconnection_actions(source: &DisconnectionSource) -> Vec<Action> {
    let status = Action::EmitStatus(ConnectionStatus::for_disconnection(source));
    match source {
        DisconnectionSource::ServerInitiated(Some(error)) if error.is_token_expired() => vec![
            Action::RefreshExpiredCredential {
                error: error.clone(),
            },
            status,
        ],
        _ => vec![
            Action::CompleteWaiters(WaiterOutcome::Failed(source.server_error().cloned())),
            status,
        ],
    }
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Application requested a connection.
    ConnectRequested,
    /// Transport started connecting on its own (automatic reconnect).
    TransportConnecting,
    /// Transport is open.
    TransportOpened,
    /// Server assigned a session id.
    SessionAssigned {
        /// The assigned session id.
        session_id: SessionId,
    },
    /// Transport failed to open.
    ConnectFailed {
        /// Error reported by the server, if any.
        error: Option<ServerError>,
    },
    /// Application requested a disconnect.
    DisconnectRequested {
        /// Source to report to the transport.
        source: DisconnectionSource,
    },
    /// Transport reported the connection is down.
    Disconnected {
        /// Why the connection went down.
        source: DisconnectionSource,
    },
}

/// How pending session waiters are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterOutcome {
    /// Connection established with this session id.
    Session(SessionId),
    /// Connection failed, optionally with a server error.
    Failed(Option<ServerError>),
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport.
    Connect,
    /// Close the transport.
    Disconnect {
        /// Source to report.
        source: DisconnectionSource,
    },
    /// Resolve every pending session waiter.
    CompleteWaiters(WaiterOutcome),
    /// Refresh the expired token, then reconnect.
    RefreshExpiredCredential {
        /// The expiry error sent by the server.
        error: ServerError,
    },
    /// Publish a new connection status.
    EmitStatus(ConnectionStatus),
}
