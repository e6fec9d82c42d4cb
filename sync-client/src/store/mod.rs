//! Local store abstraction for chatsync.
//!
//! The store holds channels, messages, reactions and users for the
//! current principal. Writes happen in sessions: a session body runs on
//! the single writer, sees its own changes, and is committed only when
//! it returns `Ok`. Readers always see the last committed state.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chatsync_types::{
    ChannelId, ChannelSnapshot, MessageId, MessagePayload, ReactionPayload, UserId, UserPayload,
};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The session could not be committed; nothing was written.
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// Read access to committed (or in-session) state.
pub trait ReadSession {
    /// Channel by id.
    fn channel(&self, cid: &ChannelId) -> Option<ChannelSnapshot>;

    /// All channels, unordered.
    fn channels(&self) -> Vec<ChannelSnapshot>;

    /// Message by id.
    fn message(&self, id: &MessageId) -> Option<MessagePayload>;

    /// Messages of a channel, oldest first.
    fn messages(&self, cid: &ChannelId) -> Vec<MessagePayload>;

    /// Reactions on a message.
    fn reactions(&self, message_id: &MessageId) -> Vec<ReactionPayload>;

    /// User by id.
    fn user(&self, id: &UserId) -> Option<UserPayload>;

    /// User the stored data belongs to.
    fn current_user_id(&self) -> Option<UserId>;

    /// Server time of the newest processed event (unix millis).
    fn last_received_event_at(&self) -> Option<u64>;
}

/// Write access inside a session.
pub trait WriteSession: ReadSession {
    /// Insert or replace a channel.
    fn save_channel(&mut self, channel: ChannelSnapshot);

    /// Remove a channel with its messages.
    fn delete_channel(&mut self, cid: &ChannelId);

    /// Set the hidden flag of a channel.
    fn set_channel_hidden(&mut self, cid: &ChannelId, hidden: bool) -> Result<(), StoreError>;

    /// Remove all messages of a channel.
    fn truncate_channel(&mut self, cid: &ChannelId) -> Result<(), StoreError>;

    /// Insert or replace a message. The channel must exist.
    fn save_message(&mut self, cid: &ChannelId, message: MessagePayload) -> Result<(), StoreError>;

    /// Delete a message; soft deletes keep it with `deleted_at` set.
    fn delete_message(
        &mut self,
        id: &MessageId,
        hard: bool,
        deleted_at: u64,
    ) -> Result<(), StoreError>;

    /// Insert or replace a reaction. The message must exist.
    fn save_reaction(&mut self, reaction: ReactionPayload) -> Result<(), StoreError>;

    /// Remove a reaction.
    fn delete_reaction(&mut self, reaction: &ReactionPayload) -> Result<(), StoreError>;

    /// Insert or replace a user.
    fn save_user(&mut self, user: UserPayload);

    /// Set the user the stored data belongs to.
    fn set_current_user(&mut self, id: Option<UserId>);

    /// Advance the newest processed event time. Never moves backwards.
    fn set_last_received_event_at(&mut self, at: u64);

    /// Drop everything.
    fn remove_all(&mut self);
}

/// Local store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Run `body` in a write session on the single writer.
    ///
    /// Sessions run one at a time in submission order. The changes made
    /// by `body` are committed only if it returns `Ok`; on `Err`, or if
    /// the commit itself fails, the store is left unchanged.
    async fn write_session<T, F>(&self, body: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WriteSession) -> Result<T, StoreError> + Send + 'static;

    /// Run `f` against the last committed state.
    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&dyn ReadSession) -> T;
}
