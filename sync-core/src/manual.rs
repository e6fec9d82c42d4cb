//! Manually handled channels.
//!
//! Some channels (high-traffic livestreams) bypass the persistent event
//! pipeline. Their events are turned into typed events directly from a
//! cached channel snapshot and handed to the caller for separate routing.
//! Only message and reaction events are handled this way.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chatsync_types::{ChannelId, ChannelSnapshot, Event, EventType};
use dashmap::DashMap;

/// Event types the registry turns into typed events.
const HANDLED_TYPES: &[EventType] = &[
    EventType::MessageNew,
    EventType::MessageUpdated,
    EventType::MessageDeleted,
    EventType::ReactionNew,
    EventType::ReactionUpdated,
    EventType::ReactionDeleted,
];

/// Channels whose events are handled outside the event pipeline.
#[derive(Debug, Default)]
pub struct ManualEventRegistry {
    registered: Mutex<HashSet<ChannelId>>,
    snapshots: DashMap<ChannelId, ChannelSnapshot>,
}

impl ManualEventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn registered(&self) -> MutexGuard<'_, HashSet<ChannelId>> {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route events of `cid` through the registry.
    pub fn register(&self, cid: ChannelId) {
        self.registered().insert(cid);
    }

    /// Stop routing events of `cid` and drop its cached snapshot.
    pub fn unregister(&self, cid: &ChannelId) {
        self.registered().remove(cid);
        self.snapshots.remove(cid);
    }

    /// Whether `cid` is registered.
    pub fn is_registered(&self, cid: &ChannelId) -> bool {
        self.registered().contains(cid)
    }

    /// Cache the latest snapshot of a channel.
    ///
    /// Snapshots are supplied by whoever loads the channel; the registry
    /// never fetches them.
    pub fn cache_channel(&self, channel: ChannelSnapshot) {
        self.snapshots.insert(channel.cid.clone(), channel);
    }

    /// Cached snapshot of `cid`.
    pub fn cached_channel(&self, cid: &ChannelId) -> Option<ChannelSnapshot> {
        self.snapshots.get(cid).map(|entry| entry.value().clone())
    }

    /// Turn a raw event of a registered channel into a typed event.
    ///
    /// Returns `None` when the event is not a raw payload, has no channel,
    /// belongs to an unregistered channel, is of an unhandled type, or
    /// when no snapshot is cached for its channel. `None` means the event
    /// takes the normal pipeline path.
    pub fn handle(&self, event: &Event) -> Option<Event> {
        let Event::Payload(payload) = event else {
            return None;
        };
        let cid = payload.channel_id()?;
        if !self.is_registered(cid) || !HANDLED_TYPES.contains(&payload.event_type) {
            return None;
        }
        let channel = self.cached_channel(cid)?;
        payload.clone().into_event(Some(channel)).ok()
    }

    /// Forget all registrations and snapshots.
    pub fn clear(&self) {
        self.registered().clear();
        self.snapshots.clear();
    }
}
