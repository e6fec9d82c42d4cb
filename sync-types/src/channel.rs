//! Locally stored channel state and channel list ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::ids::{ChannelId, UserId};
use crate::payload::ChannelPayload;

/// A channel as held by the local store.
///
/// Typed events carry the snapshot of their channel at the time the
/// event was processed, so consumers never read a half-written store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Channel id
    pub cid: ChannelId,
    /// Display name
    pub name: Option<String>,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// Last update time (unix millis)
    pub updated_at: u64,
    /// Time of the newest message (unix millis)
    pub last_message_at: Option<u64>,
    /// Number of members
    pub member_count: u32,
    /// Hidden for the current user
    pub hidden: bool,
    /// Frozen channels reject new messages
    pub frozen: bool,
    /// Known member ids
    pub members: Vec<UserId>,
}

impl ChannelSnapshot {
    /// A bare channel with only id and creation time.
    pub fn new(cid: ChannelId, created_at: u64) -> Self {
        Self {
            cid,
            name: None,
            created_at,
            updated_at: created_at,
            last_message_at: None,
            member_count: 0,
            hidden: false,
            frozen: false,
            members: Vec::new(),
        }
    }

    /// Time used for "most recent activity" ordering: the newest message,
    /// or the creation time for channels without messages.
    pub fn default_sorting_at(&self) -> u64 {
        self.last_message_at.unwrap_or(self.created_at)
    }

    /// Value of the given sort key for this channel.
    pub fn sort_value(&self, key: SortKey) -> u64 {
        match key {
            SortKey::LastMessageAt => self.default_sorting_at(),
            SortKey::CreatedAt => self.created_at,
            SortKey::UpdatedAt => self.updated_at,
            SortKey::MemberCount => u64::from(self.member_count),
        }
    }
}

impl From<ChannelPayload> for ChannelSnapshot {
    fn from(payload: ChannelPayload) -> Self {
        Self {
            cid: payload.cid,
            name: payload.name,
            created_at: payload.created_at,
            updated_at: payload.updated_at.max(payload.created_at),
            last_message_at: payload.last_message_at,
            member_count: payload.member_count,
            hidden: payload.hidden,
            frozen: payload.frozen,
            members: payload.members,
        }
    }
}

/// Channel field a list can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Newest message, falling back to creation time
    LastMessageAt,
    /// Creation time
    CreatedAt,
    /// Last update time
    UpdatedAt,
    /// Member count
    MemberCount,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

/// Ordering of a channel list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSort {
    /// Field to sort by
    pub key: SortKey,
    /// Direction
    pub direction: SortDirection,
}

impl ChannelSort {
    /// Most recently active channels first.
    pub fn recent_activity() -> Self {
        Self {
            key: SortKey::LastMessageAt,
            direction: SortDirection::Descending,
        }
    }

    /// Compare two channels; `Less` means `a` is listed before `b`.
    ///
    /// Ties are broken by channel id so the order is total.
    pub fn compare(&self, a: &ChannelSnapshot, b: &ChannelSnapshot) -> Ordering {
        let (va, vb) = (a.sort_value(self.key), b.sort_value(self.key));
        let primary = match self.direction {
            SortDirection::Ascending => va.cmp(&vb),
            SortDirection::Descending => vb.cmp(&va),
        };
        primary.then_with(|| a.cid.cmp(&b.cid))
    }

    /// Sort a slice of channels in list order.
    pub fn sort(&self, channels: &mut [ChannelSnapshot]) {
        channels.sort_by(|a, b| self.compare(a, b));
    }
}

impl Default for ChannelSort {
    fn default() -> Self {
        Self::recent_activity()
    }
}
