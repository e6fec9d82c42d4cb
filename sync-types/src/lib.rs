//! # sync-types
//!
//! Shared types for the chatsync client core.
//!
//! This crate provides the foundational types used across all chatsync crates:
//! - [`ChannelId`], [`MessageId`], [`UserId`], [`SessionId`] - Identity types
//! - [`EventPayload`] - Raw events as decoded from the connection
//! - [`Event`] - Typed events produced by the event pipeline
//! - [`ChannelSnapshot`], [`ChannelSort`] - Local channel state and list ordering
//! - [`TypesError`], [`ServerError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod channel;
mod error;
mod events;
mod ids;
mod payload;

pub use channel::{ChannelSnapshot, ChannelSort, SortDirection, SortKey};
pub use error::{ServerError, TypesError};
pub use events::{
    ChannelEvent, ChannelHiddenEvent, Event, HealthCheckEvent, MessageDeletedEvent,
    MessageNewEvent, MessageUpdatedEvent, PresenceEvent, ReactionEvent, TypingEvent,
};
pub use ids::{ChannelId, MessageId, SessionId, UserId};
pub use payload::{
    ChannelPayload, EventPayload, EventType, MessagePayload, ReactionPayload, UnreadCount,
    UserPayload,
};
