//! Typed events.
//!
//! An [`Event`] starts life as [`Event::Payload`], straight off the
//! connection. The event pipeline (or the manual event registry) turns
//! it into one of the typed variants once the channel it refers to is
//! known locally.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSnapshot;
use crate::error::TypesError;
use crate::ids::{ChannelId, SessionId};
use crate::payload::{
    EventPayload, EventType, MessagePayload, ReactionPayload, UnreadCount, UserPayload,
};

/// Connection keep-alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckEvent {
    /// Connection id assigned by the server
    pub session_id: SessionId,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// A message was posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNewEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Channel state when the event was processed
    pub channel: ChannelSnapshot,
    /// Author
    pub user: UserPayload,
    /// The new message
    pub message: MessagePayload,
    /// Users watching the channel
    pub watcher_count: Option<u32>,
    /// Unread counters of the current user
    pub unread_count: Option<UnreadCount>,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// A message was edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdatedEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Channel state when the event was processed
    pub channel: ChannelSnapshot,
    /// Editor
    pub user: UserPayload,
    /// The edited message
    pub message: MessagePayload,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// A message was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletedEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Channel state when the event was processed
    pub channel: ChannelSnapshot,
    /// Deleting user (absent for server-side deletions)
    pub user: Option<UserPayload>,
    /// The deleted message
    pub message: MessagePayload,
    /// Removed permanently rather than soft-deleted
    pub hard_delete: bool,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// A reaction was added, changed or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Channel state when the event was processed
    pub channel: ChannelSnapshot,
    /// Reacting user
    pub user: UserPayload,
    /// Message reacted to
    pub message: MessagePayload,
    /// The reaction
    pub reaction: ReactionPayload,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// Channel-level change (membership, update, visibility).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Channel state when the event was processed
    pub channel: ChannelSnapshot,
    /// Acting user
    pub user: Option<UserPayload>,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// Channel was hidden for the current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHiddenEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Channel state when the event was processed
    pub channel: ChannelSnapshot,
    /// Acting user
    pub user: Option<UserPayload>,
    /// History was cleared along with hiding
    pub clear_history: bool,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// A user went online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// The user, with the new `online` flag
    pub user: UserPayload,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// A user started or stopped typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// Channel id
    pub cid: ChannelId,
    /// Typing user
    pub user: UserPayload,
    /// Started (`true`) or stopped typing
    pub is_typing: bool,
    /// Server time (unix millis)
    pub created_at: u64,
}

/// An event flowing through the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Undecoded chat payload, not yet tied to local state
    Payload(EventPayload),
    /// Connection keep-alive
    HealthCheck(HealthCheckEvent),
    /// Message posted
    MessageNew(MessageNewEvent),
    /// Message edited
    MessageUpdated(MessageUpdatedEvent),
    /// Message deleted
    MessageDeleted(MessageDeletedEvent),
    /// Reaction added
    ReactionNew(ReactionEvent),
    /// Reaction changed
    ReactionUpdated(ReactionEvent),
    /// Reaction removed
    ReactionDeleted(ReactionEvent),
    /// Current user added to a channel
    AddedToChannel(ChannelEvent),
    /// Current user removed from a channel
    RemovedFromChannel(ChannelEvent),
    /// Channel data changed
    ChannelUpdated(ChannelEvent),
    /// Channel deleted
    ChannelDeleted(ChannelEvent),
    /// Channel hidden
    ChannelHidden(ChannelHiddenEvent),
    /// Channel visible again
    ChannelVisible(ChannelEvent),
    /// Presence change
    PresenceChanged(PresenceEvent),
    /// Typing indicator
    Typing(TypingEvent),
}

impl Event {
    /// Wire type of the event.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Payload(p) => p.event_type,
            Self::HealthCheck(_) => EventType::HealthCheck,
            Self::MessageNew(_) => EventType::MessageNew,
            Self::MessageUpdated(_) => EventType::MessageUpdated,
            Self::MessageDeleted(_) => EventType::MessageDeleted,
            Self::ReactionNew(_) => EventType::ReactionNew,
            Self::ReactionUpdated(_) => EventType::ReactionUpdated,
            Self::ReactionDeleted(_) => EventType::ReactionDeleted,
            Self::AddedToChannel(_) => EventType::NotificationAddedToChannel,
            Self::RemovedFromChannel(_) => EventType::NotificationRemovedFromChannel,
            Self::ChannelUpdated(_) => EventType::ChannelUpdated,
            Self::ChannelDeleted(_) => EventType::ChannelDeleted,
            Self::ChannelHidden(_) => EventType::ChannelHidden,
            Self::ChannelVisible(_) => EventType::ChannelVisible,
            Self::PresenceChanged(_) => EventType::UserPresenceChanged,
            Self::Typing(e) if e.is_typing => EventType::TypingStart,
            Self::Typing(_) => EventType::TypingStop,
        }
    }

    /// Channel the event refers to, if any.
    pub fn cid(&self) -> Option<&ChannelId> {
        match self {
            Self::Payload(p) => p.channel_id(),
            Self::HealthCheck(_) | Self::PresenceChanged(_) => None,
            Self::MessageNew(e) => Some(&e.cid),
            Self::MessageUpdated(e) => Some(&e.cid),
            Self::MessageDeleted(e) => Some(&e.cid),
            Self::ReactionNew(e) | Self::ReactionUpdated(e) | Self::ReactionDeleted(e) => {
                Some(&e.cid)
            }
            Self::AddedToChannel(e)
            | Self::RemovedFromChannel(e)
            | Self::ChannelUpdated(e)
            | Self::ChannelDeleted(e)
            | Self::ChannelVisible(e) => Some(&e.cid),
            Self::ChannelHidden(e) => Some(&e.cid),
            Self::Typing(e) => Some(&e.cid),
        }
    }

    /// Channel snapshot carried by the event, if any.
    pub fn channel(&self) -> Option<&ChannelSnapshot> {
        match self {
            Self::MessageNew(e) => Some(&e.channel),
            Self::MessageUpdated(e) => Some(&e.channel),
            Self::MessageDeleted(e) => Some(&e.channel),
            Self::ReactionNew(e) | Self::ReactionUpdated(e) | Self::ReactionDeleted(e) => {
                Some(&e.channel)
            }
            Self::AddedToChannel(e)
            | Self::RemovedFromChannel(e)
            | Self::ChannelUpdated(e)
            | Self::ChannelDeleted(e)
            | Self::ChannelVisible(e) => Some(&e.channel),
            Self::ChannelHidden(e) => Some(&e.channel),
            Self::Payload(_) | Self::HealthCheck(_) | Self::PresenceChanged(_) | Self::Typing(_) => {
                None
            }
        }
    }

    /// Server time of the event, if known.
    pub fn created_at(&self) -> Option<u64> {
        match self {
            Self::Payload(p) => p.created_at,
            Self::HealthCheck(e) => Some(e.created_at),
            Self::MessageNew(e) => Some(e.created_at),
            Self::MessageUpdated(e) => Some(e.created_at),
            Self::MessageDeleted(e) => Some(e.created_at),
            Self::ReactionNew(e) | Self::ReactionUpdated(e) | Self::ReactionDeleted(e) => {
                Some(e.created_at)
            }
            Self::AddedToChannel(e)
            | Self::RemovedFromChannel(e)
            | Self::ChannelUpdated(e)
            | Self::ChannelDeleted(e)
            | Self::ChannelVisible(e) => Some(e.created_at),
            Self::ChannelHidden(e) => Some(e.created_at),
            Self::PresenceChanged(e) => Some(e.created_at),
            Self::Typing(e) => Some(e.created_at),
        }
    }

    /// Whether this is still an undecoded payload.
    pub fn is_payload(&self) -> bool {
        matches!(self, Self::Payload(_))
    }
}

impl EventPayload {
    /// Build the typed event for this payload.
    ///
    /// `channel` is the local snapshot of the referenced channel. Channel
    /// scoped events fail with [`TypesError::MissingField`] when it is
    /// absent. [`EventType::Unknown`] fails with
    /// [`TypesError::UnsupportedEvent`].
    pub fn into_event(self, channel: Option<ChannelSnapshot>) -> Result<Event, TypesError> {
        let event_type = self.event_type;
        let missing = |field: &'static str| TypesError::MissingField {
            event_type: event_type.as_str().to_string(),
            field,
        };
        let created_at = self.created_at.unwrap_or_default();

        match event_type {
            EventType::HealthCheck => {
                let session_id = self.connection_id.ok_or_else(|| missing("connection_id"))?;
                return Ok(Event::HealthCheck(HealthCheckEvent {
                    session_id,
                    created_at,
                }));
            }
            EventType::UserPresenceChanged => {
                let user = self.user.ok_or_else(|| missing("user"))?;
                return Ok(Event::PresenceChanged(PresenceEvent { user, created_at }));
            }
            EventType::TypingStart | EventType::TypingStop => {
                let cid = self.cid.ok_or_else(|| missing("cid"))?;
                let user = self.user.ok_or_else(|| missing("user"))?;
                return Ok(Event::Typing(TypingEvent {
                    cid,
                    user,
                    is_typing: event_type == EventType::TypingStart,
                    created_at,
                }));
            }
            EventType::Unknown => {
                return Err(TypesError::UnsupportedEvent(event_type.as_str().to_string()))
            }
            _ => {}
        }

        let channel = channel.ok_or_else(|| missing("channel"))?;
        let cid = channel.cid.clone();

        let event = match event_type {
            EventType::MessageNew | EventType::NotificationMessageNew => {
                let message = self.message.ok_or_else(|| missing("message"))?;
                let user = self.user.unwrap_or_else(|| message.user.clone());
                Event::MessageNew(MessageNewEvent {
                    cid,
                    channel,
                    user,
                    message,
                    watcher_count: self.watcher_count,
                    unread_count: self.unread_count,
                    created_at,
                })
            }
            EventType::MessageUpdated => {
                let message = self.message.ok_or_else(|| missing("message"))?;
                let user = self.user.unwrap_or_else(|| message.user.clone());
                Event::MessageUpdated(MessageUpdatedEvent {
                    cid,
                    channel,
                    user,
                    message,
                    created_at,
                })
            }
            EventType::MessageDeleted => Event::MessageDeleted(MessageDeletedEvent {
                cid,
                channel,
                user: self.user,
                message: self.message.ok_or_else(|| missing("message"))?,
                hard_delete: self.hard_delete,
                created_at,
            }),
            EventType::ReactionNew | EventType::ReactionUpdated | EventType::ReactionDeleted => {
                let reaction = ReactionEvent {
                    cid,
                    channel,
                    user: self.user.ok_or_else(|| missing("user"))?,
                    message: self.message.ok_or_else(|| missing("message"))?,
                    reaction: self.reaction.ok_or_else(|| missing("reaction"))?,
                    created_at,
                };
                match event_type {
                    EventType::ReactionNew => Event::ReactionNew(reaction),
                    EventType::ReactionUpdated => Event::ReactionUpdated(reaction),
                    _ => Event::ReactionDeleted(reaction),
                }
            }
            EventType::ChannelHidden => Event::ChannelHidden(ChannelHiddenEvent {
                cid,
                channel,
                user: self.user,
                clear_history: self.clear_history,
                created_at,
            }),
            _ => {
                let channel_event = ChannelEvent {
                    cid,
                    channel,
                    user: self.user,
                    created_at,
                };
                match event_type {
                    EventType::NotificationAddedToChannel => Event::AddedToChannel(channel_event),
                    EventType::NotificationRemovedFromChannel => {
                        Event::RemovedFromChannel(channel_event)
                    }
                    EventType::ChannelUpdated => Event::ChannelUpdated(channel_event),
                    EventType::ChannelDeleted => Event::ChannelDeleted(channel_event),
                    EventType::ChannelVisible => Event::ChannelVisible(channel_event),
                    other => return Err(TypesError::UnsupportedEvent(other.as_str().to_string())),
                }
            }
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;

    fn snapshot() -> ChannelSnapshot {
        ChannelSnapshot::new("messaging:general".parse().unwrap(), 1)
    }

    fn message() -> MessagePayload {
        MessagePayload {
            id: MessageId::new("m1"),
            text: "hello".into(),
            user: UserPayload::new("alice"),
            created_at: 100,
            updated_at: None,
            deleted_at: None,
            parent_id: None,
            shadowed: false,
        }
    }

    // ===========================================
    // Payload -> typed event
    // ===========================================

    #[test]
    fn message_new_carries_counters_and_channel() {
        let mut payload = EventPayload::new(EventType::MessageNew);
        payload.cid = Some(snapshot().cid);
        payload.message = Some(message());
        payload.watcher_count = Some(7);
        payload.unread_count = Some(UnreadCount { channels: 1, messages: 2 });
        payload.created_at = Some(100);

        let Event::MessageNew(event) = payload.into_event(Some(snapshot())).unwrap() else {
            panic!("expected MessageNew");
        };
        assert_eq!(event.user.id.as_str(), "alice");
        assert_eq!(event.watcher_count, Some(7));
        assert_eq!(event.unread_count.unwrap().messages, 2);
        assert_eq!(event.channel, snapshot());
    }

    #[test]
    fn notification_message_new_becomes_message_new() {
        let mut payload = EventPayload::new(EventType::NotificationMessageNew);
        payload.message = Some(message());
        let event = payload.into_event(Some(snapshot())).unwrap();
        assert_eq!(event.event_type(), EventType::MessageNew);
    }

    #[test]
    fn channel_scoped_event_requires_snapshot() {
        let mut payload = EventPayload::new(EventType::MessageUpdated);
        payload.message = Some(message());
        let err = payload.into_event(None).unwrap_err();
        assert!(matches!(err, TypesError::MissingField { field: "channel", .. }));
    }

    #[test]
    fn message_deleted_keeps_hard_delete_flag() {
        let mut payload = EventPayload::new(EventType::MessageDeleted);
        payload.message = Some(message());
        payload.hard_delete = true;
        let Event::MessageDeleted(event) = payload.into_event(Some(snapshot())).unwrap() else {
            panic!("expected MessageDeleted");
        };
        assert!(event.hard_delete);
        assert!(event.user.is_none());
    }

    #[test]
    fn reaction_requires_reaction_object() {
        let mut payload = EventPayload::new(EventType::ReactionNew);
        payload.user = Some(UserPayload::new("bob"));
        payload.message = Some(message());
        let err = payload.into_event(Some(snapshot())).unwrap_err();
        assert!(matches!(err, TypesError::MissingField { field: "reaction", .. }));
    }

    #[test]
    fn health_check_needs_no_channel() {
        let mut payload = EventPayload::new(EventType::HealthCheck);
        payload.connection_id = Some(SessionId::new("conn-1"));
        let Event::HealthCheck(event) = payload.into_event(None).unwrap() else {
            panic!("expected HealthCheck");
        };
        assert_eq!(event.session_id.as_str(), "conn-1");
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let payload = EventPayload::new(EventType::Unknown);
        assert!(matches!(
            payload.into_event(Some(snapshot())),
            Err(TypesError::UnsupportedEvent(_))
        ));
    }

    // ===========================================
    // Accessors
    // ===========================================

    #[test]
    fn accessors_expose_channel_and_time() {
        let mut payload = EventPayload::new(EventType::ChannelVisible);
        payload.created_at = Some(55);
        let event = payload.into_event(Some(snapshot())).unwrap();
        assert_eq!(event.cid().unwrap().id(), "general");
        assert_eq!(event.channel().unwrap().created_at, 1);
        assert_eq!(event.created_at(), Some(55));
        assert!(!event.is_payload());
    }
}
