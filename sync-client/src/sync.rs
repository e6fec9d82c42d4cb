//! Offline recovery.
//!
//! After a reconnect the client asks the backend for the events it missed
//! while offline and replays them through the event pipeline without
//! notifying observers. Observed channel lists are then reloaded from
//! their first page, since the missed events may have reshuffled them.

use chatsync_types::{ChannelId, Event};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::api::{decode, ApiClient, ApiError, Endpoint, MissingEventsResponse};
use crate::error::ClientError;
use crate::lists::{ChannelListUpdater, ObservedList};
use crate::pipeline::EventPipeline;
use crate::store::{Store, StoreError};

/// Recovery errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Nothing to recover: no previous event, no channels, or the last
    /// sync was too recent.
    #[error("no need to sync")]
    NoNeedToSync,

    /// The missing-events endpoint failed.
    #[error("missing events request failed: {0}")]
    EndpointFailed(#[source] ApiError),

    /// Reloading a channel list failed.
    #[error("resetting query {query_id} failed: {source}")]
    ResettingQueryFailed {
        /// Query that failed
        query_id: String,
        /// Underlying error
        source: ClientError,
    },

    /// Recording the sync time failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Recovers local state after a reconnect.
pub struct SyncRepository<S> {
    api: Arc<dyn ApiClient>,
    store: Arc<S>,
    pipeline: EventPipeline<S>,
    cooldown: Duration,
    last_sync: Mutex<Option<Instant>>,
}

impl<S: Store> SyncRepository<S> {
    /// Create a repository; syncs closer together than `cooldown` are
    /// skipped.
    pub fn new(
        api: Arc<dyn ApiClient>,
        store: Arc<S>,
        pipeline: EventPipeline<S>,
        cooldown: Duration,
    ) -> Self {
        Self {
            api,
            store,
            pipeline,
            cooldown,
            last_sync: Mutex::new(None),
        }
    }

    /// Fetch and replay the events missed in `cids`.
    ///
    /// Returns the replayed events. Observers are not notified; the
    /// caller reloads whatever it shows.
    pub async fn sync_missing_events(&self, cids: &[ChannelId]) -> Result<Vec<Event>, SyncError> {
        let since = self
            .store
            .read(|session| session.last_received_event_at())
            .ok_or(SyncError::NoNeedToSync)?;
        if cids.is_empty() || self.in_cooldown() {
            return Err(SyncError::NoNeedToSync);
        }

        tracing::debug!("Syncing {} channels since {}", cids.len(), since);
        let body = self
            .api
            .recovery_request(Endpoint::missing_events(since, cids))
            .await
            .map_err(SyncError::EndpointFailed)?;
        let response: MissingEventsResponse = decode(body).map_err(SyncError::EndpointFailed)?;

        let newest = response.events.iter().filter_map(|e| e.created_at).max();
        let events: Vec<Event> = response.events.into_iter().map(Event::Payload).collect();
        let replayed = self.pipeline.process(events, false).await;

        if let Some(newest) = newest {
            self.store
                .write_session(move |session| {
                    session.set_last_received_event_at(newest);
                    Ok(())
                })
                .await?;
        }
        *self.last_sync_guard() = Some(Instant::now());

        tracing::info!("Recovered {} missed events", replayed.len());
        Ok(replayed)
    }

    /// Reload the first page of every list.
    ///
    /// Stops at the first failing list.
    pub async fn recover(
        &self,
        lists: &[Arc<ObservedList>],
        updater: &ChannelListUpdater<S>,
    ) -> Result<(), SyncError> {
        for list in lists {
            updater
                .update(list, 0)
                .await
                .map_err(|source| SyncError::ResettingQueryFailed {
                    query_id: list.query().id.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Sync missed events, then reload the lists.
    ///
    /// Lists are reloaded even when there was nothing to sync.
    pub async fn sync_local_state(
        &self,
        cids: &[ChannelId],
        lists: &[Arc<ObservedList>],
        updater: &ChannelListUpdater<S>,
    ) -> Result<(), SyncError> {
        match self.sync_missing_events(cids).await {
            Ok(_) | Err(SyncError::NoNeedToSync) => {}
            Err(e) => return Err(e),
        }
        self.recover(lists, updater).await
    }

    fn in_cooldown(&self) -> bool {
        self.last_sync_guard()
            .is_some_and(|at| at.elapsed() < self.cooldown)
    }

    fn last_sync_guard(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S> std::fmt::Debug for SyncRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRepository")
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApiClient;
    use crate::lists::ChannelListRegistry;
    use crate::store::{MemoryStore, ReadSession};
    use chatsync_core::{ListQuery, ManualEventRegistry};
    use chatsync_types::ChannelSnapshot;
    use serde_json::json;
    use tokio::sync::{broadcast, mpsc};

    fn cid() -> ChannelId {
        "messaging:general".parse().unwrap()
    }

    async fn setup(
        last_event_at: Option<u64>,
        cooldown: Duration,
    ) -> (MockApiClient, Arc<MemoryStore>, SyncRepository<MemoryStore>) {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        store
            .write_session(move |s| {
                s.save_channel(ChannelSnapshot::new(cid(), 1));
                if let Some(at) = last_event_at {
                    s.set_last_received_event_at(at);
                }
                Ok(())
            })
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pipeline = EventPipeline::with_default_middlewares(
            Arc::clone(&store),
            Arc::new(ManualEventRegistry::new()),
            tx,
            16,
        );
        let repo = SyncRepository::new(Arc::new(api.clone()), Arc::clone(&store), pipeline, cooldown);
        (api, store, repo)
    }

    fn missed(events: &[(&str, u64)]) -> serde_json::Value {
        json!({
            "events": events.iter().map(|(id, at)| json!({
                "type": "message.new",
                "cid": "messaging:general",
                "message": { "id": id, "user": { "id": "bob" }, "created_at": at },
                "created_at": at,
            })).collect::<Vec<_>>()
        })
    }

    // ===========================================
    // Missing events
    // ===========================================

    #[tokio::test]
    async fn missed_events_are_replayed_silently() {
        let (api, store, repo) = setup(Some(100), Duration::from_secs(6)).await;
        api.respond("sync", missed(&[("m1", 150), ("m2", 200)]));
        let mut batches = repo.pipeline.subscribe();

        let replayed = repo.sync_missing_events(&[cid()]).await.unwrap();

        assert_eq!(replayed.len(), 2);
        assert!(batches.try_recv().is_err());
        assert!(api.requests_to("sync")[0].recovery);
        assert_eq!(store.read(|s| s.messages(&cid()).len()), 2);
        assert_eq!(store.read(|s| s.last_received_event_at()), Some(200));
    }

    #[tokio::test]
    async fn without_previous_event_there_is_nothing_to_sync() {
        let (api, _store, repo) = setup(None, Duration::from_secs(6)).await;
        assert_eq!(
            repo.sync_missing_events(&[cid()]).await,
            Err(SyncError::NoNeedToSync)
        );
        assert!(api.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn syncs_within_cooldown_are_skipped() {
        let (api, _store, repo) = setup(Some(100), Duration::from_secs(6)).await;
        api.respond("sync", missed(&[]));
        api.respond("sync", missed(&[]));

        repo.sync_missing_events(&[cid()]).await.unwrap();
        assert_eq!(
            repo.sync_missing_events(&[cid()]).await,
            Err(SyncError::NoNeedToSync)
        );

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(repo.sync_missing_events(&[cid()]).await.is_ok());
        assert_eq!(api.requests_to("sync").len(), 2);
    }

    #[tokio::test]
    async fn endpoint_failure_is_reported() {
        let (api, _store, repo) = setup(Some(100), Duration::from_secs(6)).await;
        api.fail("sync", ApiError::Network("offline".into()));
        assert_eq!(
            repo.sync_missing_events(&[cid()]).await,
            Err(SyncError::EndpointFailed(ApiError::Network("offline".into())))
        );
    }

    // ===========================================
    // List recovery
    // ===========================================

    #[tokio::test]
    async fn local_state_sync_reloads_lists_even_without_events() {
        let (api, store, repo) = setup(None, Duration::from_secs(6)).await;
        api.respond(
            "channels",
            json!({ "channels": [{ "channel": { "cid": "messaging:fresh", "created_at": 1 } }] }),
        );
        let (tx, _) = broadcast::channel(4);
        let lists = ChannelListRegistry::new(true, tx);
        let list = lists.observe(ListQuery::new("q", json!({}), 20), None);
        list.membership().replace(vec![cid()]);
        let updater = ChannelListUpdater::new(Arc::new(api.clone()), store);

        repo.sync_local_state(&[cid()], &lists.lists(), &updater)
            .await
            .unwrap();

        assert_eq!(
            list.membership().ids(),
            vec!["messaging:fresh".parse::<ChannelId>().unwrap()]
        );
    }

    #[tokio::test]
    async fn failing_list_reload_names_the_query() {
        let (api, store, repo) = setup(None, Duration::from_secs(6)).await;
        let (tx, _) = broadcast::channel(4);
        let lists = ChannelListRegistry::new(true, tx);
        lists.observe(ListQuery::new("inbox", json!({}), 20), None);
        let updater = ChannelListUpdater::new(Arc::new(api.clone()), store);

        let err = repo.recover(&lists.lists(), &updater).await.unwrap_err();
        assert!(matches!(err, SyncError::ResettingQueryFailed { query_id, .. } if query_id == "inbox"));
    }
}
