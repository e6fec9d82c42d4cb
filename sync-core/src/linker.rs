//! Channel list membership decisions for chatsync.
//!
//! A channel list shows the result of one [`ListQuery`]. When an event
//! arrives for a channel, the [`ChannelListLinker`] decides whether that
//! channel should join the list (link), leave it (unlink), or whether the
//! list is unaffected. The decision only looks at the event, the optional
//! membership predicate and the currently loaded window, so it is a pure
//! function; applying it to a [`MembershipSet`] is a separate step.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chatsync_types::{ChannelId, ChannelSnapshot, ChannelSort, Event};

/// Client-side membership test for a channel list.
pub type MembershipFilter = Arc<dyn Fn(&ChannelSnapshot) -> bool + Send + Sync>;

/// A paginated channel list query.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    /// Stable id of the query, used as its deduplication key
    pub id: String,
    /// Server-side filter expression, sent as-is
    pub filter: serde_json::Value,
    /// List ordering
    pub sort: ChannelSort,
    /// Channels per page
    pub page_size: usize,
}

impl ListQuery {
    /// Query with the default ordering (most recent activity first).
    pub fn new(id: impl Into<String>, filter: serde_json::Value, page_size: usize) -> Self {
        Self {
            id: id.into(),
            filter,
            sort: ChannelSort::default(),
            page_size,
        }
    }

    /// Replace the ordering.
    pub fn with_sort(mut self, sort: ChannelSort) -> Self {
        self.sort = sort;
        self
    }
}

/// Outcome of a linking decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkingAction {
    /// Add the channel to the list.
    Link,
    /// Remove the channel from the list.
    Unlink,
    /// Leave the list unchanged.
    None,
}

/// Ordered set of channel ids currently loaded for one list.
#[derive(Default)]
pub struct MembershipSet {
    ids: Mutex<Vec<ChannelId>>,
}

impl MembershipSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChannelId>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the ids, in list order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.lock().clone()
    }

    /// Whether `cid` is in the list.
    pub fn contains(&self, cid: &ChannelId) -> bool {
        self.lock().contains(cid)
    }

    /// Number of channels in the list.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// The list is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Insert `cid` at `index` (clamped). Returns false if already present.
    pub fn insert(&self, index: usize, cid: ChannelId) -> bool {
        let mut ids = self.lock();
        if ids.contains(&cid) {
            return false;
        }
        let index = index.min(ids.len());
        ids.insert(index, cid);
        true
    }

    /// Remove `cid`. Returns false if it was not present.
    pub fn remove(&self, cid: &ChannelId) -> bool {
        let mut ids = self.lock();
        let before = ids.len();
        ids.retain(|id| id != cid);
        ids.len() != before
    }

    /// Replace the whole list, dropping duplicates.
    pub fn replace(&self, cids: Vec<ChannelId>) {
        let mut ids = self.lock();
        ids.clear();
        for cid in cids {
            if !ids.contains(&cid) {
                ids.push(cid);
            }
        }
    }

    /// Append a page, skipping ids already present.
    pub fn extend(&self, cids: Vec<ChannelId>) {
        let mut ids = self.lock();
        for cid in cids {
            if !ids.contains(&cid) {
                ids.push(cid);
            }
        }
    }

    /// Empty the list.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl fmt::Debug for MembershipSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}

/// How an event relates to list membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// Channel gained activity or was (re)introduced to the user
    New,
    /// Channel data changed
    Updated,
}

fn classify(event: &Event) -> Option<(EventClass, &ChannelSnapshot)> {
    match event {
        Event::MessageNew(e) => Some((EventClass::New, &e.channel)),
        Event::AddedToChannel(e) | Event::ChannelVisible(e) => Some((EventClass::New, &e.channel)),
        Event::ChannelUpdated(e) => Some((EventClass::Updated, &e.channel)),
        Event::ChannelHidden(e) => Some((EventClass::Updated, &e.channel)),
        _ => None,
    }
}

/// Decides list membership changes from incoming events.
#[derive(Debug, Clone, Copy)]
pub struct ChannelListLinker {
    automatic_filtering: bool,
}

impl ChannelListLinker {
    /// Create a linker.
    ///
    /// With `automatic_filtering` disabled, lists without a membership
    /// predicate never change in response to events.
    pub fn new(automatic_filtering: bool) -> Self {
        Self {
            automatic_filtering,
        }
    }

    /// Decide what `event` means for the list of `query`.
    ///
    /// `window` holds the loaded channels in list order and `is_linked`
    /// tells whether the event's channel is already in the list.
    pub fn decide(
        &self,
        query: &ListQuery,
        filter: Option<&MembershipFilter>,
        window: &[ChannelSnapshot],
        is_linked: bool,
        event: &Event,
    ) -> LinkingAction {
        if !self.automatic_filtering && filter.is_none() {
            return LinkingAction::None;
        }
        let Some((class, channel)) = classify(event) else {
            return LinkingAction::None;
        };
        let matches = filter.map_or(true, |f| (**f)(channel));

        match (class, is_linked) {
            (EventClass::New, false) if matches && fits_window(query, window, channel) => {
                LinkingAction::Link
            }
            (EventClass::Updated, true) if filter.is_some() && !matches => LinkingAction::Unlink,
            (EventClass::Updated, false) if matches && fits_window(query, window, channel) => {
                LinkingAction::Link
            }
            _ => LinkingAction::None,
        }
    }

    /// Decide and apply the outcome to `membership`.
    ///
    /// Linked channels are inserted at their sorted position within
    /// `window`. Returns the channel id and the action taken.
    pub fn apply(
        &self,
        query: &ListQuery,
        filter: Option<&MembershipFilter>,
        window: &[ChannelSnapshot],
        membership: &MembershipSet,
        event: &Event,
    ) -> Option<(ChannelId, LinkingAction)> {
        let cid = event.cid()?.clone();
        let action = self.decide(query, filter, window, membership.contains(&cid), event);
        match action {
            LinkingAction::Link => {
                let channel = event.channel()?;
                let index = window
                    .iter()
                    .position(|loaded| query.sort.compare(channel, loaded).is_lt())
                    .unwrap_or(window.len());
                membership.insert(index, cid.clone());
            }
            LinkingAction::Unlink => {
                membership.remove(&cid);
            }
            LinkingAction::None => {}
        }
        Some((cid, action))
    }
}

/// Whether a channel belongs inside the loaded window.
///
/// A window shorter than a page holds the whole list, so anything fits.
/// Otherwise the channel must not sort after the last loaded channel.
fn fits_window(query: &ListQuery, window: &[ChannelSnapshot], channel: &ChannelSnapshot) -> bool {
    if window.len() < query.page_size {
        return true;
    }
    match window.last() {
        Some(last) => !query.sort.compare(channel, last).is_gt(),
        None => true,
    }
}
