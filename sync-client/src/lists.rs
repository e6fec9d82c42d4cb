//! Observed channel lists.
//!
//! An application observes a [`ListQuery`] through the
//! [`ChannelListRegistry`]. Pages are loaded with the
//! [`ChannelListUpdater`]; afterwards every committed event batch is run
//! through the [`ChannelListLinker`] so the loaded window follows live
//! changes without refetching.

use chatsync_core::{
    ChannelListLinker, LinkingAction, ListQuery, ManualEventRegistry, MembershipFilter,
    MembershipSet, RequestDeduplicationTracker,
};
use chatsync_types::{ChannelId, ChannelSnapshot, Event, EventType};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::api::{decode, ApiClient, ChannelListResponse, ChannelState, Endpoint};
use crate::error::ClientError;
use crate::store::Store;

/// A membership change made to an observed list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkingDecision {
    /// Query the list belongs to
    pub query_id: String,
    /// Channel that was linked or unlinked
    pub cid: ChannelId,
    /// What happened
    pub action: LinkingAction,
}

/// A list query being observed, with its loaded membership.
pub struct ObservedList {
    query: ListQuery,
    filter: Option<MembershipFilter>,
    membership: Arc<MembershipSet>,
}

impl ObservedList {
    /// The query.
    pub fn query(&self) -> &ListQuery {
        &self.query
    }

    /// Client-side membership predicate.
    pub fn filter(&self) -> Option<&MembershipFilter> {
        self.filter.as_ref()
    }

    /// Channel ids currently in the list.
    pub fn membership(&self) -> &Arc<MembershipSet> {
        &self.membership
    }

    /// Loaded channels in list order.
    ///
    /// Channels missing from the store are skipped.
    pub fn window<S: Store>(&self, store: &S) -> Vec<ChannelSnapshot> {
        let ids = self.membership.ids();
        let mut window: Vec<ChannelSnapshot> =
            store.read(|session| ids.iter().filter_map(|cid| session.channel(cid)).collect());
        self.query.sort.sort(&mut window);
        window
    }
}

impl fmt::Debug for ObservedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedList")
            .field("query", &self.query)
            .field("filtered", &self.filter.is_some())
            .field("loaded", &self.membership.len())
            .finish()
    }
}

/// The lists currently observed by the application.
pub struct ChannelListRegistry {
    linker: ChannelListLinker,
    lists: RwLock<HashMap<String, Arc<ObservedList>>>,
    decisions: broadcast::Sender<LinkingDecision>,
}

impl ChannelListRegistry {
    /// Create a registry publishing decisions on `decisions`.
    pub fn new(automatic_filtering: bool, decisions: broadcast::Sender<LinkingDecision>) -> Self {
        Self {
            linker: ChannelListLinker::new(automatic_filtering),
            lists: RwLock::new(HashMap::new()),
            decisions,
        }
    }

    /// Start observing `query`.
    ///
    /// Observing a query id that is already observed replaces it with an
    /// empty membership.
    pub fn observe(&self, query: ListQuery, filter: Option<MembershipFilter>) -> Arc<ObservedList> {
        let list = Arc::new(ObservedList {
            query,
            filter,
            membership: Arc::new(MembershipSet::new()),
        });
        self.lists
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(list.query.id.clone(), Arc::clone(&list));
        list
    }

    /// Stop observing a query.
    pub fn stop_observing(&self, query_id: &str) -> Option<Arc<ObservedList>> {
        self.lists
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(query_id)
    }

    /// Observed list by query id.
    pub fn get(&self, query_id: &str) -> Option<Arc<ObservedList>> {
        self.lists
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(query_id)
            .cloned()
    }

    /// Every observed list.
    pub fn lists(&self) -> Vec<Arc<ObservedList>> {
        self.lists
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Empty every list's membership; the lists stay observed.
    pub fn clear_memberships(&self) {
        for list in self.lists() {
            list.membership.clear();
        }
    }

    /// Subscribe to linking decisions.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkingDecision> {
        self.decisions.subscribe()
    }

    /// Channels that events of `events` could link but the store lacks.
    ///
    /// Only raw payloads that carry no channel object count; channels
    /// handled manually are skipped. Empty while no list is observed.
    pub fn missing_channels<S: Store>(
        &self,
        store: &S,
        manual: &ManualEventRegistry,
        events: &[Event],
    ) -> Vec<ChannelId> {
        if self.lists().is_empty() {
            return Vec::new();
        }
        let mut cids: Vec<ChannelId> = events
            .iter()
            .filter_map(|event| match event {
                Event::Payload(p) if p.channel.is_none() && may_link(p.event_type) => {
                    p.channel_id().cloned()
                }
                _ => None,
            })
            .filter(|cid| !manual.is_registered(cid))
            .collect();
        cids.sort();
        cids.dedup();
        store.read(|session| {
            cids.into_iter()
                .filter(|cid| session.channel(cid).is_none())
                .collect()
        })
    }

    /// Run committed events through the linker for every observed list.
    ///
    /// Returns the link and unlink decisions, which are also published.
    pub fn handle_events<S: Store>(&self, store: &S, events: &[Event]) -> Vec<LinkingDecision> {
        let mut decisions = Vec::new();
        for list in self.lists() {
            for event in events {
                let window = list.window(store);
                let Some((cid, action)) = self.linker.apply(
                    &list.query,
                    list.filter.as_ref(),
                    &window,
                    &list.membership,
                    event,
                ) else {
                    continue;
                };
                if action == LinkingAction::None {
                    continue;
                }
                tracing::debug!("List {}: {:?} {}", list.query.id, action, cid);
                let decision = LinkingDecision {
                    query_id: list.query.id.clone(),
                    cid,
                    action,
                };
                // No subscribers is fine
                let _ = self.decisions.send(decision.clone());
                decisions.push(decision);
            }
        }
        decisions
    }
}

/// Payload types the linker may turn into a link.
fn may_link(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::MessageNew
            | EventType::NotificationMessageNew
            | EventType::NotificationAddedToChannel
            | EventType::ChannelUpdated
            | EventType::ChannelHidden
            | EventType::ChannelVisible
    )
}

impl fmt::Debug for ChannelListRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelListRegistry")
            .field("lists", &self.lists().len())
            .finish()
    }
}

/// Result of a page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Page loaded; these channels were added to the list, in order.
    Loaded(Vec<ChannelId>),
    /// A request for the same query was already in flight.
    Skipped,
}

/// Loads channel list pages and individual channels.
pub struct ChannelListUpdater<S> {
    api: Arc<dyn ApiClient>,
    store: Arc<S>,
    queries: RequestDeduplicationTracker<String>,
    channels: RequestDeduplicationTracker<ChannelId>,
}

impl<S: Store> ChannelListUpdater<S> {
    /// Create an updater.
    pub fn new(api: Arc<dyn ApiClient>, store: Arc<S>) -> Self {
        Self {
            api,
            store,
            queries: RequestDeduplicationTracker::new(),
            channels: RequestDeduplicationTracker::new(),
        }
    }

    /// Load the page of `list` starting at `offset`.
    ///
    /// Offset zero replaces the membership; later offsets extend it. A
    /// second call for the same query while one is in flight returns
    /// [`PageOutcome::Skipped`] without a request.
    pub async fn update(
        &self,
        list: &ObservedList,
        offset: usize,
    ) -> Result<PageOutcome, ClientError> {
        let query = list.query();
        if self.queries.claim([query.id.clone()]).is_empty() {
            tracing::debug!("Query {} already loading", query.id);
            return Ok(PageOutcome::Skipped);
        }

        let endpoint = Endpoint::query_channels(query, offset, query.page_size);
        let result = self.load(endpoint).await;
        self.queries.remove([&query.id]);

        let cids = result?;
        if offset == 0 {
            list.membership().replace(cids.clone());
        } else {
            list.membership().extend(cids.clone());
        }
        tracing::debug!(
            "Query {} loaded {} channels at offset {}",
            query.id,
            cids.len(),
            offset
        );
        Ok(PageOutcome::Loaded(cids))
    }

    /// Load the page after the currently loaded channels.
    pub async fn load_next_page(&self, list: &ObservedList) -> Result<PageOutcome, ClientError> {
        self.update(list, list.membership().len()).await
    }

    /// Load specific channels into the store.
    ///
    /// Used for channels an incoming event could link before the store
    /// has seen them. Channels that already have a request in flight are
    /// left to it.
    /// Returns the channels this call fetched.
    pub async fn fetch_channels(
        &self,
        cids: Vec<ChannelId>,
    ) -> Result<Vec<ChannelId>, ClientError> {
        let claimed = self.channels.claim(cids);
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let result = self.load(Endpoint::channels_by_id(&claimed)).await;
        self.channels.remove(&claimed);
        result
    }

    /// Whether a page request for `query_id` is in flight.
    pub fn is_loading(&self, query_id: &str) -> bool {
        self.queries.is_executing(&query_id.to_string())
    }

    async fn load(&self, endpoint: Endpoint) -> Result<Vec<ChannelId>, ClientError> {
        let response: ChannelListResponse = decode(self.api.request(endpoint).await?)?;
        let cids: Vec<ChannelId> = response
            .channels
            .iter()
            .map(|state| state.channel.cid.clone())
            .collect();
        let channels = response.channels;
        self.store
            .write_session(move |session| {
                for ChannelState { channel, messages } in channels {
                    let cid = channel.cid.clone();
                    session.save_channel(ChannelSnapshot::from(channel));
                    for message in messages {
                        session.save_message(&cid, message)?;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(cids)
    }
}

impl<S> fmt::Debug for ChannelListUpdater<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelListUpdater")
            .field("queries_in_flight", &self.queries.len())
            .field("channels_in_flight", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApiClient;
    use crate::store::{MemoryStore, ReadSession};
    use chatsync_types::{ChannelEvent, ChannelPayload, MessageNewEvent, MessagePayload, UserPayload};
    use serde_json::json;
    use std::time::Duration;

    fn cid(id: &str) -> ChannelId {
        format!("messaging:{id}").parse().unwrap()
    }

    fn channel_json(id: &str, last_message_at: u64) -> serde_json::Value {
        json!({
            "channel": {
                "cid": format!("messaging:{id}"),
                "created_at": 1,
                "last_message_at": last_message_at,
            },
            "messages": [],
        })
    }

    fn page(ids: &[(&str, u64)]) -> serde_json::Value {
        json!({ "channels": ids.iter().map(|(id, at)| channel_json(id, *at)).collect::<Vec<_>>() })
    }

    fn snapshot(id: &str, last_message_at: u64) -> ChannelSnapshot {
        let mut channel = ChannelSnapshot::new(cid(id), 1);
        channel.last_message_at = Some(last_message_at);
        channel
    }

    fn message_new(channel: ChannelSnapshot) -> Event {
        let at = channel.default_sorting_at();
        Event::MessageNew(MessageNewEvent {
            cid: channel.cid.clone(),
            channel,
            user: UserPayload::new("bob"),
            message: MessagePayload {
                id: "m".into(),
                text: String::new(),
                user: UserPayload::new("bob"),
                created_at: at,
                updated_at: None,
                deleted_at: None,
                parent_id: None,
                shadowed: false,
            },
            watcher_count: None,
            unread_count: None,
            created_at: at,
        })
    }

    fn registry() -> ChannelListRegistry {
        let (tx, _) = broadcast::channel(16);
        ChannelListRegistry::new(true, tx)
    }

    fn updater(api: &MockApiClient, store: &Arc<MemoryStore>) -> ChannelListUpdater<MemoryStore> {
        ChannelListUpdater::new(Arc::new(api.clone()), Arc::clone(store))
    }

    // ===========================================
    // Updater
    // ===========================================

    #[tokio::test]
    async fn first_page_replaces_and_next_page_extends() {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        api.respond("channels", page(&[("a", 30), ("b", 20)]));
        api.respond("channels", page(&[("b", 20), ("c", 10)]));
        let lists = registry();
        let list = lists.observe(ListQuery::new("q", json!({}), 2), None);
        let updater = updater(&api, &store);

        let first = updater.update(&list, 0).await.unwrap();
        assert_eq!(first, PageOutcome::Loaded(vec![cid("a"), cid("b")]));

        updater.load_next_page(&list).await.unwrap();
        assert_eq!(list.membership().ids(), vec![cid("a"), cid("b"), cid("c")]);
        assert_eq!(api.requests()[1].endpoint.body.as_ref().unwrap()["offset"], 2);
        assert!(store.read(|s| s.channel(&cid("c")).is_some()));
    }

    #[tokio::test]
    async fn concurrent_updates_for_one_query_are_deduplicated() {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        api.respond("channels", page(&[("a", 30)]));
        let lists = registry();
        let list = lists.observe(ListQuery::new("q", json!({}), 20), None);
        let updater = Arc::new(updater(&api, &store));

        api.pause();
        let first = {
            let updater = Arc::clone(&updater);
            let list = Arc::clone(&list);
            tokio::spawn(async move { updater.update(&list, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(updater.is_loading("q"));

        let second = updater.update(&list, 0).await.unwrap();
        assert_eq!(second, PageOutcome::Skipped);

        api.resume();
        assert!(matches!(first.await.unwrap(), Ok(PageOutcome::Loaded(_))));
        assert_eq!(api.requests_to("channels").len(), 1);
        assert!(!updater.is_loading("q"));
    }

    #[tokio::test]
    async fn failed_update_releases_the_query() {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        let lists = registry();
        let list = lists.observe(ListQuery::new("q", json!({}), 20), None);
        let updater = updater(&api, &store);

        assert!(updater.update(&list, 0).await.is_err());
        assert!(!updater.is_loading("q"));
        assert!(list.membership().is_empty());
    }

    #[tokio::test]
    async fn fetch_channels_skips_channels_in_flight() {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        api.respond("channels", page(&[("a", 1)]));
        api.respond("channels", page(&[("b", 1)]));
        let updater = Arc::new(updater(&api, &store));

        api.pause();
        let first = {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move { updater.fetch_channels(vec![cid("a")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move { updater.fetch_channels(vec![cid("a"), cid("b")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        api.resume();

        assert_eq!(first.await.unwrap().unwrap(), vec![cid("a")]);
        second.await.unwrap().unwrap();
        let requests = api.requests_to("channels");
        assert_eq!(
            requests[1].endpoint.body.as_ref().unwrap()["filter_conditions"]["cid"]["$in"],
            json!(["messaging:b"])
        );
    }

    fn payload(event_type: EventType, channel: &str) -> Event {
        let mut payload = chatsync_types::EventPayload::new(event_type);
        payload.cid = Some(cid(channel));
        Event::Payload(payload)
    }

    #[tokio::test]
    async fn missing_channels_are_the_uncached_link_candidates() {
        let store = store_with(vec![snapshot("known", 1)]).await;
        let lists = registry();
        let manual = ManualEventRegistry::new();
        manual.register(cid("manual"));
        let events = vec![
            payload(EventType::MessageNew, "known"),
            payload(EventType::MessageNew, "fresh"),
            payload(EventType::NotificationAddedToChannel, "fresh"),
            payload(EventType::MessageNew, "manual"),
            payload(EventType::ReactionNew, "other"),
        ];

        // Nothing to link into yet
        assert!(lists.missing_channels(store.as_ref(), &manual, &events).is_empty());

        lists.observe(ListQuery::new("q", json!({}), 20), None);
        assert_eq!(
            lists.missing_channels(store.as_ref(), &manual, &events),
            vec![cid("fresh")]
        );
    }

    // ===========================================
    // Linking
    // ===========================================

    async fn store_with(channels: Vec<ChannelSnapshot>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .write_session(move |s| {
                for channel in channels {
                    s.save_channel(channel);
                }
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn full_window_links_only_channels_that_sort_inside_it() {
        let store = store_with(vec![snapshot("a", 30), snapshot("b", 20)]).await;
        let lists = registry();
        let mut decisions = lists.subscribe();
        let list = lists.observe(ListQuery::new("q", json!({}), 2), None);
        list.membership().replace(vec![cid("a"), cid("b")]);

        let older = lists.handle_events(store.as_ref(), &[message_new(snapshot("old", 5))]);
        assert!(older.is_empty());

        let newer = lists.handle_events(store.as_ref(), &[message_new(snapshot("new", 25))]);
        assert_eq!(
            newer,
            vec![LinkingDecision {
                query_id: "q".into(),
                cid: cid("new"),
                action: LinkingAction::Link,
            }]
        );
        assert_eq!(list.membership().ids(), vec![cid("a"), cid("new"), cid("b")]);
        assert_eq!(decisions.recv().await.unwrap(), newer[0]);
    }

    #[tokio::test]
    async fn updated_channel_failing_filter_is_unlinked() {
        let mut frozen = snapshot("a", 30);
        frozen.frozen = true;
        let store = store_with(vec![frozen.clone()]).await;
        let lists = registry();
        let filter: MembershipFilter = Arc::new(|c: &ChannelSnapshot| !c.frozen);
        let list = lists.observe(ListQuery::new("q", json!({}), 20), Some(filter));
        list.membership().replace(vec![cid("a")]);

        let updated = Event::ChannelUpdated(ChannelEvent {
            cid: cid("a"),
            channel: frozen,
            user: None,
            created_at: 40,
        });
        let decisions = lists.handle_events(store.as_ref(), &[updated]);

        assert_eq!(decisions[0].action, LinkingAction::Unlink);
        assert!(list.membership().is_empty());
    }

    #[test]
    fn observing_again_resets_membership() {
        let lists = registry();
        let list = lists.observe(ListQuery::new("q", json!({}), 20), None);
        list.membership().replace(vec![cid("a")]);

        let again = lists.observe(ListQuery::new("q", json!({}), 20), None);
        assert!(again.membership().is_empty());
        assert_eq!(lists.lists().len(), 1);
        assert!(lists.stop_observing("q").is_some());
        assert!(lists.get("q").is_none());
    }

    #[tokio::test]
    async fn channel_payload_fields_survive_persistence() {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        let payload: ChannelPayload = serde_json::from_value(json!({
            "cid": "messaging:a",
            "created_at": 1,
            "member_count": 4,
        }))
        .unwrap();
        api.respond(
            "channels",
            json!({ "channels": [{ "channel": payload, "messages": [] }] }),
        );
        let updater = updater(&api, &store);

        updater.fetch_channels(vec![cid("a")]).await.unwrap();
        assert_eq!(store.read(|s| s.channel(&cid("a")).unwrap().member_count), 4);
    }
}
