//! In-memory store.
//!
//! Committed state is an immutable snapshot behind an `Arc`. A write
//! session clones the snapshot into a draft, runs the body against it and
//! swaps the draft in on success, so readers never observe a partially
//! applied session.

use super::{ReadSession, StoreError, WriteSession};
use async_trait::async_trait;
use chatsync_types::{
    ChannelId, ChannelSnapshot, MessageId, MessagePayload, ReactionPayload, UserId, UserPayload,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Default)]
struct StoreData {
    channels: HashMap<ChannelId, ChannelSnapshot>,
    messages: HashMap<MessageId, (ChannelId, MessagePayload)>,
    reactions: HashMap<MessageId, Vec<ReactionPayload>>,
    users: HashMap<UserId, UserPayload>,
    current_user: Option<UserId>,
    last_received_event_at: Option<u64>,
}

impl ReadSession for StoreData {
    fn channel(&self, cid: &ChannelId) -> Option<ChannelSnapshot> {
        self.channels.get(cid).cloned()
    }

    fn channels(&self) -> Vec<ChannelSnapshot> {
        self.channels.values().cloned().collect()
    }

    fn message(&self, id: &MessageId) -> Option<MessagePayload> {
        self.messages.get(id).map(|(_, m)| m.clone())
    }

    fn messages(&self, cid: &ChannelId) -> Vec<MessagePayload> {
        let mut messages: Vec<_> = self
            .messages
            .values()
            .filter(|(owner, _)| owner == cid)
            .map(|(_, m)| m.clone())
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        messages
    }

    fn reactions(&self, message_id: &MessageId) -> Vec<ReactionPayload> {
        self.reactions.get(message_id).cloned().unwrap_or_default()
    }

    fn user(&self, id: &UserId) -> Option<UserPayload> {
        self.users.get(id).cloned()
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.current_user.clone()
    }

    fn last_received_event_at(&self) -> Option<u64> {
        self.last_received_event_at
    }
}

impl WriteSession for StoreData {
    fn save_channel(&mut self, channel: ChannelSnapshot) {
        self.channels.insert(channel.cid.clone(), channel);
    }

    fn delete_channel(&mut self, cid: &ChannelId) {
        self.channels.remove(cid);
        let _ = self.truncate_channel(cid);
    }

    fn set_channel_hidden(&mut self, cid: &ChannelId, hidden: bool) -> Result<(), StoreError> {
        let channel = self
            .channels
            .get_mut(cid)
            .ok_or_else(|| StoreError::NotFound(format!("channel {cid}")))?;
        channel.hidden = hidden;
        Ok(())
    }

    fn truncate_channel(&mut self, cid: &ChannelId) -> Result<(), StoreError> {
        let removed: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|(_, (owner, _))| owner == cid)
            .map(|(id, _)| id.clone())
            .collect();
        for id in removed {
            self.messages.remove(&id);
            self.reactions.remove(&id);
        }
        Ok(())
    }

    fn save_message(&mut self, cid: &ChannelId, message: MessagePayload) -> Result<(), StoreError> {
        let channel = self
            .channels
            .get_mut(cid)
            .ok_or_else(|| StoreError::NotFound(format!("channel {cid}")))?;
        if channel.last_message_at.map_or(true, |t| message.created_at > t) && message.parent_id.is_none() {
            channel.last_message_at = Some(message.created_at);
        }
        self.users.insert(message.user.id.clone(), message.user.clone());
        self.messages
            .insert(message.id.clone(), (cid.clone(), message));
        Ok(())
    }

    fn delete_message(
        &mut self,
        id: &MessageId,
        hard: bool,
        deleted_at: u64,
    ) -> Result<(), StoreError> {
        if hard {
            self.reactions.remove(id);
            return self
                .messages
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("message {id}")));
        }
        let (_, message) = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        message.deleted_at = Some(deleted_at);
        Ok(())
    }

    fn save_reaction(&mut self, reaction: ReactionPayload) -> Result<(), StoreError> {
        if !self.messages.contains_key(&reaction.message_id) {
            return Err(StoreError::NotFound(format!("message {}", reaction.message_id)));
        }
        let reactions = self.reactions.entry(reaction.message_id.clone()).or_default();
        reactions.retain(|r| !(r.user_id == reaction.user_id && r.kind == reaction.kind));
        reactions.push(reaction);
        Ok(())
    }

    fn delete_reaction(&mut self, reaction: &ReactionPayload) -> Result<(), StoreError> {
        let reactions = self
            .reactions
            .get_mut(&reaction.message_id)
            .ok_or_else(|| StoreError::NotFound(format!("reactions of {}", reaction.message_id)))?;
        reactions.retain(|r| !(r.user_id == reaction.user_id && r.kind == reaction.kind));
        Ok(())
    }

    fn save_user(&mut self, user: UserPayload) {
        self.users.insert(user.id.clone(), user);
    }

    fn set_current_user(&mut self, id: Option<UserId>) {
        self.current_user = id;
    }

    fn set_last_received_event_at(&mut self, at: u64) {
        if self.last_received_event_at.map_or(true, |current| at > current) {
            self.last_received_event_at = Some(at);
        }
    }

    fn remove_all(&mut self) {
        *self = StoreData::default();
    }
}

/// In-memory [`Store`](super::Store).
#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: RwLock<Arc<StoreData>>,
    writer: tokio::sync::Mutex<()>,
    fail_next_commit: Mutex<Option<String>>,
    commits: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next commit to fail with the given reason.
    pub fn fail_next_commit(&self, reason: &str) {
        *self
            .fail_next_commit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Arc<StoreData> {
        let committed = self
            .committed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&committed)
    }
}

#[async_trait]
impl super::Store for MemoryStore {
    async fn write_session<T, F>(&self, body: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WriteSession) -> Result<T, StoreError> + Send + 'static,
    {
        let _writer = self.writer.lock().await;

        let mut draft = StoreData::clone(&self.snapshot());
        let output = body(&mut draft)?;

        let forced = self
            .fail_next_commit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reason) = forced {
            return Err(StoreError::CommitFailed(reason));
        }

        *self
            .committed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(draft);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(output)
    }

    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&dyn ReadSession) -> T,
    {
        let snapshot = self.snapshot();
        f(snapshot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chatsync_types::UserPayload;

    fn cid() -> ChannelId {
        "messaging:general".parse().unwrap()
    }

    fn message(id: &str, created_at: u64) -> MessagePayload {
        MessagePayload {
            id: id.into(),
            text: id.into(),
            user: UserPayload::new("alice"),
            created_at,
            updated_at: None,
            deleted_at: None,
            parent_id: None,
            shadowed: false,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .write_session(|s| {
                s.save_channel(ChannelSnapshot::new(cid(), 1));
                s.save_message(&cid(), message("m2", 20))?;
                s.save_message(&cid(), message("m1", 10))
            })
            .await
            .unwrap();
        store
    }

    // ===========================================
    // Sessions
    // ===========================================

    #[tokio::test]
    async fn committed_session_is_visible_to_readers() {
        let store = seeded().await;
        let ids: Vec<_> = store.read(|s| s.messages(&cid()).into_iter().map(|m| m.id).collect());
        assert_eq!(ids, vec![MessageId::new("m1"), MessageId::new("m2")]);
        assert_eq!(store.read(|s| s.channel(&cid()).unwrap().last_message_at), Some(20));
        assert!(store.read(|s| s.user(&"alice".into()).is_some()));
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn failing_body_discards_the_draft() {
        let store = seeded().await;
        let result = store
            .write_session(|s| {
                s.save_message(&cid(), message("m3", 30))?;
                s.save_message(&"messaging:missing".parse().unwrap(), message("m4", 40))
            })
            .await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(store.read(|s| s.message(&"m3".into()).is_none()));
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn failed_commit_discards_the_draft() {
        let store = seeded().await;
        store.fail_next_commit("disk full");
        let result = store
            .write_session(|s| {
                s.remove_all();
                Ok(())
            })
            .await;

        assert_eq!(result, Err(StoreError::CommitFailed("disk full".into())));
        assert!(store.read(|s| s.channel(&cid()).is_some()));
    }

    #[tokio::test]
    async fn session_sees_its_own_writes() {
        let store = seeded().await;
        let seen = store
            .write_session(|s| {
                s.save_message(&cid(), message("m3", 30))?;
                Ok(s.messages(&cid()).len())
            })
            .await
            .unwrap();
        assert_eq!(seen, 3);
    }

    // ===========================================
    // Entities
    // ===========================================

    #[tokio::test]
    async fn soft_and_hard_delete() {
        let store = seeded().await;
        store
            .write_session(|s| {
                s.delete_message(&"m1".into(), false, 99)?;
                s.delete_message(&"m2".into(), true, 99)
            })
            .await
            .unwrap();

        assert_eq!(store.read(|s| s.message(&"m1".into()).unwrap().deleted_at), Some(99));
        assert!(store.read(|s| s.message(&"m2".into()).is_none()));
    }

    #[tokio::test]
    async fn reactions_replace_same_user_and_kind() {
        let store = seeded().await;
        let reaction = |score| ReactionPayload {
            message_id: "m1".into(),
            user_id: "bob".into(),
            kind: "like".into(),
            score,
            created_at: 5,
        };
        store
            .write_session(move |s| {
                s.save_reaction(reaction(1))?;
                s.save_reaction(reaction(3))
            })
            .await
            .unwrap();
        let reactions = store.read(|s| s.reactions(&"m1".into()));
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].score, 3);
    }

    #[tokio::test]
    async fn last_received_event_time_never_moves_back() {
        let store = MemoryStore::new();
        store
            .write_session(|s| {
                s.set_last_received_event_at(50);
                s.set_last_received_event_at(20);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.read(|s| s.last_received_event_at()), Some(50));
    }

    #[tokio::test]
    async fn truncate_keeps_channel() {
        let store = seeded().await;
        store
            .write_session(|s| s.truncate_channel(&cid()))
            .await
            .unwrap();
        assert!(store.read(|s| s.messages(&cid()).is_empty()));
        assert!(store.read(|s| s.channel(&cid()).is_some()));
    }
}
