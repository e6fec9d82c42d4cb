//! Raw event payloads as delivered by the realtime connection.
//!
//! Payloads are decoded leniently: every field except the type is
//! optional, and unknown event types decode to [`EventType::Unknown`]
//! rather than failing the whole batch. Turning a payload into a typed
//! [`Event`](crate::Event) happens later, once the channel context is
//! known.

use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, MessageId, SessionId, UserId};

/// Event type discriminator (`"type"` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A message was posted
    #[serde(rename = "message.new")]
    MessageNew,
    /// A message was edited
    #[serde(rename = "message.updated")]
    MessageUpdated,
    /// A message was deleted
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    /// A reaction was added
    #[serde(rename = "reaction.new")]
    ReactionNew,
    /// A reaction was changed
    #[serde(rename = "reaction.updated")]
    ReactionUpdated,
    /// A reaction was removed
    #[serde(rename = "reaction.deleted")]
    ReactionDeleted,
    /// A message was posted in a channel the user is not watching
    #[serde(rename = "notification.message_new")]
    NotificationMessageNew,
    /// The current user was added to a channel
    #[serde(rename = "notification.added_to_channel")]
    NotificationAddedToChannel,
    /// The current user was removed from a channel
    #[serde(rename = "notification.removed_from_channel")]
    NotificationRemovedFromChannel,
    /// Channel data changed
    #[serde(rename = "channel.updated")]
    ChannelUpdated,
    /// Channel was deleted
    #[serde(rename = "channel.deleted")]
    ChannelDeleted,
    /// Channel was hidden for the current user
    #[serde(rename = "channel.hidden")]
    ChannelHidden,
    /// Hidden channel became visible again
    #[serde(rename = "channel.visible")]
    ChannelVisible,
    /// A user went online or offline
    #[serde(rename = "user.presence.changed")]
    UserPresenceChanged,
    /// A user started typing
    #[serde(rename = "typing.start")]
    TypingStart,
    /// A user stopped typing
    #[serde(rename = "typing.stop")]
    TypingStop,
    /// Connection keep-alive carrying the connection id
    #[serde(rename = "health.check")]
    HealthCheck,
    /// Any type this client does not know about
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageNew => "message.new",
            Self::MessageUpdated => "message.updated",
            Self::MessageDeleted => "message.deleted",
            Self::ReactionNew => "reaction.new",
            Self::ReactionUpdated => "reaction.updated",
            Self::ReactionDeleted => "reaction.deleted",
            Self::NotificationMessageNew => "notification.message_new",
            Self::NotificationAddedToChannel => "notification.added_to_channel",
            Self::NotificationRemovedFromChannel => "notification.removed_from_channel",
            Self::ChannelUpdated => "channel.updated",
            Self::ChannelDeleted => "channel.deleted",
            Self::ChannelHidden => "channel.hidden",
            Self::ChannelVisible => "channel.visible",
            Self::UserPresenceChanged => "user.presence.changed",
            Self::TypingStart => "typing.start",
            Self::TypingStop => "typing.stop",
            Self::HealthCheck => "health.check",
            Self::Unknown => "unknown",
        }
    }
}

/// User object embedded in events and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    /// User id
    pub id: UserId,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether the user is currently connected
    #[serde(default)]
    pub online: bool,
}

impl UserPayload {
    /// A user with only an id.
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            online: false,
        }
    }
}

/// Message object embedded in events and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Message id
    pub id: MessageId,
    /// Message text
    #[serde(default)]
    pub text: String,
    /// Author
    pub user: UserPayload,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// Last edit time (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    /// Soft-deletion time (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    /// Parent message for thread replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    /// Shadowed messages are only visible to their author
    #[serde(default)]
    pub shadowed: bool,
}

/// Reaction object embedded in reaction events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// Message the reaction belongs to
    pub message_id: MessageId,
    /// Reacting user
    pub user_id: UserId,
    /// Reaction kind (`"like"`, `"love"`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Score for cumulative reactions
    #[serde(default = "default_score")]
    pub score: u32,
    /// Creation time (unix millis)
    #[serde(default)]
    pub created_at: u64,
}

fn default_score() -> u32 {
    1
}

/// Channel object embedded in events and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayload {
    /// Channel id
    pub cid: ChannelId,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// Last update time (unix millis)
    #[serde(default)]
    pub updated_at: u64,
    /// Time of the newest message (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<u64>,
    /// Number of members
    #[serde(default)]
    pub member_count: u32,
    /// Hidden for the current user
    #[serde(default)]
    pub hidden: bool,
    /// Frozen channels reject new messages
    #[serde(default)]
    pub frozen: bool,
    /// Member ids, when the backend includes them
    #[serde(default)]
    pub members: Vec<UserId>,
}

/// Unread counters attached to new-message events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnreadCount {
    /// Unread channels
    #[serde(default)]
    pub channels: u32,
    /// Unread messages across all channels
    #[serde(default)]
    pub messages: u32,
}

/// A raw event as decoded from the realtime connection or the
/// missing-events endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Channel the event refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<ChannelId>,
    /// Acting user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserPayload>,
    /// Message the event refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    /// Reaction the event refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<ReactionPayload>,
    /// Full channel data, when the backend attaches it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelPayload>,
    /// Connection id (health checks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<SessionId>,
    /// Number of users watching the channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watcher_count: Option<u32>,
    /// Unread counters of the current user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<UnreadCount>,
    /// Server time of the event (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    /// Message was removed permanently
    #[serde(default)]
    pub hard_delete: bool,
    /// Hiding also cleared the channel history
    #[serde(default)]
    pub clear_history: bool,
}

impl EventPayload {
    /// An empty payload of the given type.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            cid: None,
            user: None,
            message: None,
            reaction: None,
            channel: None,
            connection_id: None,
            watcher_count: None,
            unread_count: None,
            created_at: None,
            hard_delete: false,
            clear_history: false,
        }
    }

    /// Decode a payload from JSON.
    pub fn from_json(json: &str) -> Result<Self, crate::TypesError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Channel the event refers to, from `cid` or the attached channel.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.cid
            .as_ref()
            .or_else(|| self.channel.as_ref().map(|c| &c.cid))
    }
}
