//! Event pipeline.
//!
//! Every event received from the connection (or recovered through the
//! missing-events endpoint) passes through the pipeline. Events of
//! manually handled channels are routed to their own subscribers first.
//! The rest run through an ordered chain of [`EventMiddleware`]s inside
//! one store write session; a middleware may rewrite an event, pass it
//! on, or drop it. The surviving events are published as one batch, and
//! only after the session committed.

mod middleware;

pub use middleware::{ChannelVisibilityMiddleware, EventDataProcessor, HealthCheckMiddleware};

use chatsync_core::ManualEventRegistry;
use chatsync_types::{Event, SessionId};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::store::{Store, WriteSession};

/// One stage of the event pipeline.
pub trait EventMiddleware: Send + Sync + 'static {
    /// Process `event` inside the current write session.
    ///
    /// Returning `None` drops the event; later stages do not see it.
    fn handle(&self, event: Event, session: &mut dyn WriteSession) -> Option<Event>;
}

/// Ordered middleware chain with persistence and publication.
pub struct EventPipeline<S> {
    store: Arc<S>,
    middlewares: Arc<[Arc<dyn EventMiddleware>]>,
    registry: Arc<ManualEventRegistry>,
    events: broadcast::Sender<Arc<Vec<Event>>>,
    manual: broadcast::Sender<Event>,
}

impl<S> Clone for EventPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            middlewares: Arc::clone(&self.middlewares),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            manual: self.manual.clone(),
        }
    }
}

impl<S: Store> EventPipeline<S> {
    /// Create a pipeline with the given middleware chain.
    pub fn new(
        store: Arc<S>,
        registry: Arc<ManualEventRegistry>,
        middlewares: Vec<Arc<dyn EventMiddleware>>,
        capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (manual, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            middlewares: middlewares.into(),
            registry,
            events,
            manual,
        }
    }

    /// Create a pipeline with the standard chain: health checks, then
    /// persistence, then channel visibility.
    ///
    /// Session ids found in health checks are sent on `session_ids`.
    pub fn with_default_middlewares(
        store: Arc<S>,
        registry: Arc<ManualEventRegistry>,
        session_ids: mpsc::UnboundedSender<SessionId>,
        capacity: usize,
    ) -> Self {
        let middlewares: Vec<Arc<dyn EventMiddleware>> = vec![
            Arc::new(HealthCheckMiddleware::new(session_ids)),
            Arc::new(EventDataProcessor::new()),
            Arc::new(ChannelVisibilityMiddleware::new()),
        ];
        Self::new(store, registry, middlewares, capacity)
    }

    /// Subscribe to committed event batches.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<Event>>> {
        self.events.subscribe()
    }

    /// Subscribe to events of manually handled channels.
    pub fn subscribe_manual(&self) -> broadcast::Receiver<Event> {
        self.manual.subscribe()
    }

    /// Registry deciding which channels bypass the chain.
    pub fn registry(&self) -> &Arc<ManualEventRegistry> {
        &self.registry
    }

    /// Process a batch of events.
    ///
    /// Returns the events that survived the chain, in input order. When
    /// the write session fails nothing was persisted and the result is
    /// empty. With `broadcast` set, a non-empty result is also published
    /// to subscribers after the commit, and events of manually handled
    /// channels reach the manual subscribers. Without it they are
    /// consumed silently.
    pub async fn process(&self, events: Vec<Event>, broadcast: bool) -> Vec<Event> {
        let mut chained = Vec::with_capacity(events.len());
        for event in events {
            match self.registry.handle(&event) {
                Some(manual) => {
                    if broadcast {
                        // No manual subscribers is fine
                        let _ = self.manual.send(manual);
                    }
                }
                None => chained.push(event),
            }
        }
        if chained.is_empty() {
            return Vec::new();
        }

        let middlewares = Arc::clone(&self.middlewares);
        let count = chained.len();
        let result = self
            .store
            .write_session(move |session| {
                let mut output = Vec::with_capacity(chained.len());
                'events: for event in chained {
                    let mut current = event;
                    for middleware in middlewares.iter() {
                        match middleware.handle(current, &mut *session) {
                            Some(next) => current = next,
                            None => continue 'events,
                        }
                    }
                    output.push(current);
                }
                Ok(output)
            })
            .await;

        let processed = match result {
            Ok(processed) => processed,
            Err(e) => {
                tracing::error!("Failed to commit {} events: {}", count, e);
                return Vec::new();
            }
        };

        tracing::debug!("Processed {} of {} events", processed.len(), count);
        if broadcast && !processed.is_empty() {
            let _ = self.events.send(Arc::new(processed.clone()));
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ReadSession};
    use chatsync_types::{
        ChannelId, ChannelSnapshot, EventPayload, EventType, MessagePayload, UserPayload,
    };

    fn cid(id: &str) -> ChannelId {
        format!("messaging:{id}").parse().unwrap()
    }

    fn message(id: &str, created_at: u64) -> MessagePayload {
        MessagePayload {
            id: id.into(),
            text: format!("text of {id}"),
            user: UserPayload::new("bob"),
            created_at,
            updated_at: None,
            deleted_at: None,
            parent_id: None,
            shadowed: false,
        }
    }

    fn message_new(channel: &str, id: &str, created_at: u64) -> Event {
        let mut payload = EventPayload::new(EventType::MessageNew);
        payload.cid = Some(cid(channel));
        payload.message = Some(message(id, created_at));
        payload.created_at = Some(created_at);
        Event::Payload(payload)
    }

    async fn seeded_store(channels: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let cids: Vec<_> = channels.iter().map(|c| cid(c)).collect();
        store
            .write_session(move |s| {
                for cid in cids {
                    s.save_channel(ChannelSnapshot::new(cid, 1));
                }
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    fn pipeline(store: Arc<MemoryStore>) -> (EventPipeline<MemoryStore>, mpsc::UnboundedReceiver<SessionId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = EventPipeline::with_default_middlewares(
            store,
            Arc::new(ManualEventRegistry::new()),
            tx,
            16,
        );
        (pipeline, rx)
    }

    /// Drops every event whose message text contains "drop".
    struct DropMarked;

    impl EventMiddleware for DropMarked {
        fn handle(&self, event: Event, _session: &mut dyn WriteSession) -> Option<Event> {
            match &event {
                Event::MessageNew(e) if e.message.text.contains("drop") => None,
                _ => Some(event),
            }
        }
    }

    // ===========================================
    // Processing
    // ===========================================

    #[tokio::test]
    async fn events_are_persisted_converted_and_published_in_order() {
        let store = seeded_store(&["a"]).await;
        let (pipeline, _rx) = pipeline(Arc::clone(&store));
        let mut batches = pipeline.subscribe();

        let processed = pipeline
            .process(
                vec![message_new("a", "m1", 10), message_new("a", "m2", 20)],
                true,
            )
            .await;

        assert_eq!(processed.len(), 2);
        assert!(matches!(&processed[0], Event::MessageNew(e) if e.message.id.as_str() == "m1"));
        assert!(matches!(&processed[1], Event::MessageNew(e) if e.message.id.as_str() == "m2"));
        assert_eq!(store.read(|s| s.messages(&cid("a")).len()), 2);
        assert_eq!(store.read(|s| s.last_received_event_at()), Some(20));

        let batch = batches.recv().await.unwrap();
        assert_eq!(*batch, processed);
    }

    #[tokio::test]
    async fn commit_failure_publishes_nothing() {
        let store = seeded_store(&["a"]).await;
        let (pipeline, _rx) = pipeline(Arc::clone(&store));
        let mut batches = pipeline.subscribe();

        store.fail_next_commit("disk full");
        let processed = pipeline
            .process(vec![message_new("a", "m1", 10)], true)
            .await;

        assert!(processed.is_empty());
        assert!(batches.try_recv().is_err());
        assert!(store.read(|s| s.messages(&cid("a")).is_empty()));
    }

    #[tokio::test]
    async fn without_broadcast_events_are_persisted_silently() {
        let store = seeded_store(&["a"]).await;
        let (pipeline, _rx) = pipeline(Arc::clone(&store));
        let mut batches = pipeline.subscribe();

        let processed = pipeline
            .process(vec![message_new("a", "m1", 10)], false)
            .await;

        assert_eq!(processed.len(), 1);
        assert!(batches.try_recv().is_err());
        assert!(store.read(|s| s.message(&"m1".into()).is_some()));
    }

    #[tokio::test]
    async fn dropping_middleware_stops_later_stages() {
        let store = seeded_store(&["a"]).await;
        let middlewares: Vec<Arc<dyn EventMiddleware>> = vec![
            Arc::new(EventDataProcessor::new()),
            Arc::new(DropMarked),
            Arc::new(ChannelVisibilityMiddleware::new()),
        ];
        let pipeline = EventPipeline::new(
            Arc::clone(&store),
            Arc::new(ManualEventRegistry::new()),
            middlewares,
            16,
        );

        let mut dropped = message_new("a", "m1", 10);
        if let Event::Payload(p) = &mut dropped {
            if let Some(m) = p.message.as_mut() {
                m.text = "please drop me".into();
            }
        }
        let processed = pipeline
            .process(vec![dropped, message_new("a", "m2", 20)], true)
            .await;

        assert_eq!(processed.len(), 1);
        // Persisted by the earlier stage even though dropped afterwards
        assert_eq!(store.read(|s| s.messages(&cid("a")).len()), 2);
    }

    #[tokio::test]
    async fn events_for_unknown_channels_do_not_abort_the_batch() {
        let store = seeded_store(&["a"]).await;
        let (pipeline, _rx) = pipeline(Arc::clone(&store));

        let processed = pipeline
            .process(
                vec![message_new("missing", "m0", 5), message_new("a", "m1", 10)],
                true,
            )
            .await;

        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].cid(), Some(&cid("a")));
    }

    // ===========================================
    // Manual routing
    // ===========================================

    #[tokio::test]
    async fn manually_handled_channels_bypass_the_chain() {
        let store = seeded_store(&["a"]).await;
        let (pipeline, _rx) = pipeline(Arc::clone(&store));
        let mut manual = pipeline.subscribe_manual();
        let mut batches = pipeline.subscribe();

        pipeline.registry().register(cid("live"));
        pipeline
            .registry()
            .cache_channel(ChannelSnapshot::new(cid("live"), 1));

        let processed = pipeline
            .process(vec![message_new("live", "m1", 10)], true)
            .await;

        assert!(processed.is_empty());
        assert!(batches.try_recv().is_err());
        let event = manual.recv().await.unwrap();
        assert!(matches!(event, Event::MessageNew(e) if e.cid == cid("live")));
        assert!(store.read(|s| s.message(&"m1".into()).is_none()));
    }

    #[tokio::test]
    async fn replayed_events_of_manual_channels_notify_no_one() {
        let store = seeded_store(&["a"]).await;
        let (pipeline, _rx) = pipeline(Arc::clone(&store));
        let mut manual = pipeline.subscribe_manual();

        pipeline.registry().register(cid("live"));
        pipeline
            .registry()
            .cache_channel(ChannelSnapshot::new(cid("live"), 1));

        let processed = pipeline
            .process(vec![message_new("live", "m1", 10)], false)
            .await;

        assert!(processed.is_empty());
        assert!(manual.try_recv().is_err());
        assert!(store.read(|s| s.message(&"m1".into()).is_none()));
    }

    // ===========================================
    // Health checks
    // ===========================================

    #[tokio::test]
    async fn health_checks_report_session_id_and_are_dropped() {
        let store = seeded_store(&[]).await;
        let (pipeline, mut rx) = pipeline(store);
        let mut payload = EventPayload::new(EventType::HealthCheck);
        payload.connection_id = Some(SessionId::new("conn-1"));

        let processed = pipeline.process(vec![Event::Payload(payload)], true).await;

        assert!(processed.is_empty());
        assert_eq!(rx.recv().await, Some(SessionId::new("conn-1")));
    }
}
