//! # sync-core
//!
//! Pure logic for chatsync (no I/O, instant tests).
//!
//! This crate implements the state machines and decision rules of the
//! chat sync core without any network or disk I/O, enabling fast unit
//! tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, API, store) is performed by `sync-client`,
//! which interprets the actions and decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod linker;
pub mod manual;
pub mod state;
pub mod tracker;

pub use cursor::{CursorError, Page, PageMerge, PaginationCursorTracker, PaginationParameter};
pub use linker::{ChannelListLinker, LinkingAction, ListQuery, MembershipFilter, MembershipSet};
pub use manual::ManualEventRegistry;
pub use state::{
    Action, ConnectionState, ConnectionStatus, DisconnectionSource, Event, WaiterOutcome,
};
pub use tracker::RequestDeduplicationTracker;
