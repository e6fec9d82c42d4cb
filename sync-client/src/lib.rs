//! # sync-client
//!
//! Client sync core for chatsync.
//!
//! This is the library an application embeds to keep a local copy of its
//! chat data in step with the backend.
//!
//! ## Features
//!
//! - **Connection Coordination**: one realtime connection per client, with
//!   shared session id waiters, token refresh and user switching
//! - **Event Pipeline**: received events are persisted in one write
//!   session and published only after the commit
//! - **Channel Lists**: observed lists follow incoming events and page in
//!   from the backend
//! - **Offline Recovery**: missed events are replayed after a reconnect
//! - **Pure State Machine**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use chatsync_client::{ClientConfig, ConnectionCoordinator, Principal};
//!
//! let config = ClientConfig::load("chatsync.toml".as_ref())?;
//! let coordinator = ConnectionCoordinator::new(config, transport, api, store);
//!
//! // Connect as a user
//! let session_id = coordinator.reload_session(principal).await?;
//!
//! // Follow committed events
//! let mut events = coordinator.subscribe_events();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod lists;
pub mod messages;
pub mod pipeline;
pub mod store;
pub mod sync;
pub mod transport;

pub use api::{ApiClient, ApiError, Endpoint, MockApiClient};
pub use config::{ClientConfig, ConfigError};
pub use coordinator::{ConnectionCoordinator, Workers};
pub use credentials::{
    Credential, CredentialRepository, GuestTokenProvider, Principal, StaticTokenProvider, Token,
    TokenError, TokenProvider, UserInfo,
};
pub use error::ClientError;
pub use lists::{ChannelListRegistry, ChannelListUpdater, LinkingDecision, ObservedList, PageOutcome};
pub use messages::{MessagePage, MessagePaginator};
pub use pipeline::{EventMiddleware, EventPipeline};
pub use store::{MemoryStore, ReadSession, Store, StoreError, WriteSession};
pub use sync::{SyncError, SyncRepository};
pub use transport::{ConnectEndpoint, MockTransport, Transport, TransportError, TransportEvent};

// Re-exported so applications need only one dependency
pub use chatsync_core::{ConnectionStatus, DisconnectionSource, ListQuery, MembershipFilter};
