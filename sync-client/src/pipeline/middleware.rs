//! Standard pipeline stages.

use chatsync_types::{ChannelSnapshot, Event, EventPayload, EventType, SessionId};
use tokio::sync::mpsc;

use super::EventMiddleware;
use crate::store::{StoreError, WriteSession};

/// Consumes health checks.
///
/// The connection id carried by a health check is forwarded to the
/// connection coordinator, which uses it as the session id if it does
/// not have one yet. Health checks never reach later stages.
#[derive(Debug)]
pub struct HealthCheckMiddleware {
    session_ids: mpsc::UnboundedSender<SessionId>,
}

impl HealthCheckMiddleware {
    /// Create the stage; session ids are sent on `session_ids`.
    pub fn new(session_ids: mpsc::UnboundedSender<SessionId>) -> Self {
        Self { session_ids }
    }
}

impl EventMiddleware for HealthCheckMiddleware {
    fn handle(&self, event: Event, _session: &mut dyn WriteSession) -> Option<Event> {
        let session_id = match &event {
            Event::HealthCheck(check) => Some(check.session_id.clone()),
            Event::Payload(payload) if payload.event_type == EventType::HealthCheck => {
                payload.connection_id.clone()
            }
            _ => return Some(event),
        };
        if let Some(session_id) = session_id {
            // Coordinator gone means nobody cares about the id
            let _ = self.session_ids.send(session_id);
        }
        None
    }
}

/// Persists raw payloads and turns them into typed events.
///
/// Users, channels, messages and reactions carried by a payload are
/// written to the session. The typed event is then built from the
/// stored channel, so it reflects this batch's writes. A failed write
/// is logged and the event still goes on; payloads that cannot be typed
/// (unknown type, channel not stored) are dropped.
#[derive(Debug, Default)]
pub struct EventDataProcessor;

impl EventDataProcessor {
    /// Create the stage.
    pub fn new() -> Self {
        Self
    }

    fn persist(
        &self,
        payload: &EventPayload,
        session: &mut dyn WriteSession,
    ) -> Result<Option<ChannelSnapshot>, StoreError> {
        if let Some(user) = &payload.user {
            session.save_user(user.clone());
        }
        if let Some(channel) = &payload.channel {
            session.save_channel(ChannelSnapshot::from(channel.clone()));
        }
        let Some(cid) = payload.channel_id().cloned() else {
            return Ok(None);
        };

        match payload.event_type {
            EventType::MessageNew
            | EventType::NotificationMessageNew
            | EventType::MessageUpdated => {
                if let Some(message) = &payload.message {
                    session.save_message(&cid, message.clone())?;
                }
            }
            EventType::MessageDeleted => {
                if let Some(message) = &payload.message {
                    let deleted_at = message
                        .deleted_at
                        .or(payload.created_at)
                        .unwrap_or_default();
                    session.delete_message(&message.id, payload.hard_delete, deleted_at)?;
                }
            }
            EventType::ReactionNew | EventType::ReactionUpdated => {
                if let Some(message) = &payload.message {
                    session.save_message(&cid, message.clone())?;
                }
                if let Some(reaction) = &payload.reaction {
                    session.save_reaction(reaction.clone())?;
                }
            }
            EventType::ReactionDeleted => {
                if let Some(reaction) = &payload.reaction {
                    session.delete_reaction(reaction)?;
                }
            }
            EventType::ChannelDeleted => {
                // Event still needs the channel after it is gone
                let snapshot = session.channel(&cid);
                session.delete_channel(&cid);
                return Ok(snapshot);
            }
            _ => {}
        }
        Ok(session.channel(&cid))
    }
}

impl EventMiddleware for EventDataProcessor {
    fn handle(&self, event: Event, session: &mut dyn WriteSession) -> Option<Event> {
        let Event::Payload(payload) = event else {
            return Some(event);
        };

        let channel = match self.persist(&payload, session) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    "Failed to persist {} event: {}",
                    payload.event_type.as_str(),
                    e
                );
                payload.channel_id().and_then(|cid| session.channel(cid))
            }
        };
        if let Some(created_at) = payload.created_at {
            session.set_last_received_event_at(created_at);
        }

        let event_type = payload.event_type;
        match payload.into_event(channel) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Dropping {} event: {}", event_type.as_str(), e);
                None
            }
        }
    }
}

/// Keeps the hidden flag of channels up to date.
///
/// Hidden events hide the channel (clearing its history when asked);
/// visible events and new non-shadowed messages unhide it. The event's
/// channel snapshot is updated to match. Events are always forwarded.
#[derive(Debug, Default)]
pub struct ChannelVisibilityMiddleware;

impl ChannelVisibilityMiddleware {
    /// Create the stage.
    pub fn new() -> Self {
        Self
    }
}

impl EventMiddleware for ChannelVisibilityMiddleware {
    fn handle(&self, event: Event, session: &mut dyn WriteSession) -> Option<Event> {
        let event = match event {
            Event::ChannelHidden(mut hidden) => {
                if let Err(e) = session.set_channel_hidden(&hidden.cid, true) {
                    tracing::warn!("Failed to hide {}: {}", hidden.cid, e);
                }
                if hidden.clear_history {
                    if let Err(e) = session.truncate_channel(&hidden.cid) {
                        tracing::warn!("Failed to clear history of {}: {}", hidden.cid, e);
                    }
                }
                hidden.channel.hidden = true;
                Event::ChannelHidden(hidden)
            }
            Event::ChannelVisible(mut visible) => {
                if let Err(e) = session.set_channel_hidden(&visible.cid, false) {
                    tracing::warn!("Failed to unhide {}: {}", visible.cid, e);
                }
                visible.channel.hidden = false;
                Event::ChannelVisible(visible)
            }
            Event::MessageNew(mut new) if new.channel.hidden && !new.message.shadowed => {
                if let Err(e) = session.set_channel_hidden(&new.cid, false) {
                    tracing::warn!("Failed to unhide {}: {}", new.cid, e);
                }
                new.channel.hidden = false;
                Event::MessageNew(new)
            }
            other => other,
        };
        Some(event)
    }
}
