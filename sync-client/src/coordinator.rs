//! Connection coordinator.
//!
//! The coordinator owns the realtime connection of one client. It drives
//! the transport from the pure [`ConnectionState`] machine, hands session
//! ids to whoever waits for one, refreshes expired tokens, switches
//! between users, and feeds received events through the event pipeline
//! into the store and the observed channel lists.
//!
//! # Architecture
//!
//! A background listener task consumes [`TransportEvent`]s and health
//! check session ids. State transitions are computed under one lock and
//! their immediate effects (resolving waiters, publishing the status)
//! happen under it too, so observers see them in transition order. I/O
//! requested by a transition runs afterwards, outside the lock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chatsync_core::{
    Action, ConnectionState, ConnectionStatus, DisconnectionSource, Event as StateEvent,
    ListQuery, ManualEventRegistry, MembershipFilter, WaiterOutcome,
};
use chatsync_types::{ChannelId, ChannelSnapshot, Event, ServerError, SessionId, UserId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::credentials::{Credential, CredentialRepository, Principal};
use crate::error::ClientError;
use crate::lists::{ChannelListRegistry, ChannelListUpdater, LinkingDecision, ObservedList};
use crate::messages::MessagePaginator;
use crate::pipeline::EventPipeline;
use crate::store::Store;
use crate::sync::{SyncError, SyncRepository};
use crate::transport::{ConnectEndpoint, Transport, TransportEvent};

type SessionWaiter = oneshot::Sender<Result<SessionId, ClientError>>;

/// Background workers tied to the current user.
///
/// Rebuilt from scratch when the client switches users, so no request
/// tracking or cursor state leaks from one user to the next.
pub struct Workers<S> {
    updater: ChannelListUpdater<S>,
    messages: MessagePaginator<S>,
    sync: SyncRepository<S>,
}

impl<S: Store> Workers<S> {
    fn new(
        config: &ClientConfig,
        api: &Arc<dyn ApiClient>,
        store: &Arc<S>,
        pipeline: &EventPipeline<S>,
    ) -> Self {
        Self {
            updater: ChannelListUpdater::new(Arc::clone(api), Arc::clone(store)),
            messages: MessagePaginator::new(
                Arc::clone(api),
                Arc::clone(store),
                config.message_page_size,
            ),
            sync: SyncRepository::new(
                Arc::clone(api),
                Arc::clone(store),
                pipeline.clone(),
                config.sync_cooldown(),
            ),
        }
    }

    /// Channel list loader.
    pub fn updater(&self) -> &ChannelListUpdater<S> {
        &self.updater
    }

    /// Message pagination.
    pub fn messages(&self) -> &MessagePaginator<S> {
        &self.messages
    }

    /// Offline recovery.
    pub fn sync(&self) -> &SyncRepository<S> {
        &self.sync
    }
}

#[derive(Default)]
struct Machine {
    state: ConnectionState,
    waiters: Vec<SessionWaiter>,
}

struct Inner<T, S> {
    config: ClientConfig,
    transport: Arc<T>,
    api: Arc<dyn ApiClient>,
    store: Arc<S>,
    credentials: CredentialRepository,
    machine: Mutex<Machine>,
    status: watch::Sender<ConnectionStatus>,
    pipeline: EventPipeline<S>,
    lists: ChannelListRegistry,
    workers: RwLock<Arc<Workers<S>>>,
    ever_connected: AtomicBool,
    switching: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Coordinates the connection, credentials and event flow of a client.
///
/// Must be created inside a tokio runtime. Dropping the coordinator stops
/// its listener and resolves every pending session waiter with
/// [`ClientError::Deallocated`].
pub struct ConnectionCoordinator<T: Transport, S: Store> {
    inner: Arc<Inner<T, S>>,
    listener: JoinHandle<()>,
}

impl<T: Transport, S: Store> ConnectionCoordinator<T, S> {
    /// Create a coordinator and start listening to `transport`.
    pub fn new(
        config: ClientConfig,
        transport: Arc<T>,
        api: Arc<dyn ApiClient>,
        store: Arc<S>,
    ) -> Self {
        let capacity = config.event_capacity();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let pipeline = EventPipeline::with_default_middlewares(
            Arc::clone(&store),
            Arc::new(ManualEventRegistry::new()),
            session_tx,
            capacity,
        );
        let (decisions, _) = broadcast::channel(capacity);
        let workers = Workers::new(&config, &api, &store, &pipeline);
        let (status, _) = watch::channel(ConnectionStatus::Initialized);

        let inner = Arc::new(Inner {
            lists: ChannelListRegistry::new(config.automatic_filtering, decisions),
            config,
            transport: Arc::clone(&transport),
            api,
            store,
            credentials: CredentialRepository::new(),
            machine: Mutex::new(Machine::default()),
            status,
            pipeline,
            workers: RwLock::new(Arc::new(workers)),
            ever_connected: AtomicBool::new(false),
            switching: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        });

        // Subscribe before anyone can call connect()
        let events = transport.subscribe();
        let listener = tokio::spawn(listen(Arc::downgrade(&inner), events, session_rx));

        Self { inner, listener }
    }

    /// Connect and wait for a session id.
    ///
    /// Returns at once when already connected. Concurrent callers share
    /// one connection attempt and all receive its outcome.
    pub async fn connect(&self) -> Result<SessionId, ClientError> {
        if !self.inner.config.active_mode {
            return Err(ClientError::NotActive);
        }
        if self.inner.credentials.current().is_none() {
            return Err(ClientError::MissingTokenProvider);
        }
        let waiter = match self.inner.register_waiter() {
            Ok(session_id) => return Ok(session_id),
            Err(waiter) => waiter,
        };

        let actions = self.inner.transition(StateEvent::ConnectRequested);
        self.inner.execute(actions).await?;
        wait_for_session(waiter, self.inner.config.session_id_timeout()).await
    }

    /// Wait for a session id without starting a connection.
    ///
    /// `timeout` defaults to the configured session id timeout. The
    /// returned future does not borrow the coordinator; if the
    /// coordinator is dropped first it resolves with
    /// [`ClientError::Deallocated`].
    pub fn provide_session_id(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<SessionId, ClientError>> + Send + 'static {
        let timeout = timeout.or_else(|| self.inner.config.session_id_timeout());
        let registered = self.inner.register_waiter();
        async move {
            match registered {
                Ok(session_id) => Ok(session_id),
                Err(waiter) => wait_for_session(waiter, timeout).await,
            }
        }
    }

    /// Disconnect.
    ///
    /// Queued API requests are flushed and a credential refresh in
    /// progress is cancelled. The transport is only told to disconnect
    /// when it is connected; the call returns once it confirmed.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        tracing::info!("Disconnecting");
        self.inner.api.flush_requests_queue();
        self.inner.credentials.cancel_refresh();
        let actions = self.inner.transition(StateEvent::DisconnectRequested {
            source: DisconnectionSource::UserInitiated,
        });
        self.inner.execute(actions).await
    }

    /// Connect as `principal`.
    ///
    /// For the user already connected, only the token is replaced and a
    /// connection is made if there is none. For a different user the
    /// current connection is closed and everything stored for the
    /// previous user is dropped before connecting.
    pub async fn reload_session(&self, principal: Principal) -> Result<SessionId, ClientError> {
        if !self.inner.config.active_mode {
            return Err(ClientError::NotActive);
        }
        let _switching = self.inner.switching.lock().await;

        let credential = principal.resolve().await?;
        let user_id = credential.user.id.clone();

        match self.inner.credentials.current_user() {
            Some(previous) if previous != user_id => {
                tracing::info!("Switching user {} -> {}", previous, user_id);
                self.inner.api.flush_requests_queue();
                self.inner.credentials.cancel_refresh();

                let source = DisconnectionSource::UserInitiated;
                self.inner.transport.disconnect(source.clone()).await?;
                self.inner.confirm_disconnected(source);

                self.inner.reset_local_state(&user_id).await?;
            }
            Some(_) => tracing::debug!("Refreshing token of {}", user_id),
            None => {
                // Never connected: data left by another user is dropped
                // without touching the transport
                let stored = self.inner.store.read(|s| s.current_user_id());
                match stored {
                    Some(stored) if stored != user_id => {
                        tracing::info!("Dropping local data of {}", stored);
                        self.inner.reset_local_state(&user_id).await?;
                    }
                    _ => {
                        let user_id = user_id.clone();
                        self.inner
                            .store
                            .write_session(move |s| {
                                s.set_current_user(Some(user_id));
                                Ok(())
                            })
                            .await?;
                    }
                }
            }
        }

        self.inner.install(credential);
        self.connect().await
    }

    /// Recover from an expired token reported by an API call.
    ///
    /// A live connection is closed first, the token refreshed, and the
    /// connection reopened only if it was live before. Returns the new
    /// session id when a reconnect happened.
    pub async fn handle_expired_credential(
        &self,
        error: ServerError,
    ) -> Result<Option<SessionId>, ClientError> {
        tracing::info!("Handling expired credential: {}", error);
        let was_connected = self.inner.lock_machine().state.is_connected();

        if was_connected {
            let source = DisconnectionSource::ServerInitiated(Some(error.clone()));
            self.inner.transport.disconnect(source.clone()).await?;
            // Refresh runs below instead of in the background
            self.inner.confirm_disconnected(source);
        }

        let credential = match self.inner.credentials.refresh().await {
            Ok(credential) => credential,
            Err(e) => {
                self.inner.fail_waiters(&e);
                if was_connected {
                    // No reconnect is coming
                    self.inner.status.send_replace(ConnectionStatus::Disconnected {
                        error: Some(error),
                    });
                }
                return Err(e);
            }
        };
        self.inner.set_endpoint(&credential);

        if was_connected {
            self.connect().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Show passive instances as disconnected.
    pub fn force_status_for_passive_mode(&self) {
        if !self.inner.config.active_mode {
            self.inner
                .status
                .send_replace(ConnectionStatus::Disconnected { error: None });
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribe to connection status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Current session id.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock_machine().state.session_id().cloned()
    }

    /// User of the current credential.
    pub fn current_user(&self) -> Option<UserId> {
        self.inner.credentials.current_user()
    }

    /// Subscribe to committed event batches.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<Vec<Event>>> {
        self.inner.pipeline.subscribe()
    }

    /// Subscribe to events of manually handled channels.
    pub fn subscribe_manual_events(&self) -> broadcast::Receiver<Event> {
        self.inner.pipeline.subscribe_manual()
    }

    /// Subscribe to channel list membership changes.
    pub fn subscribe_linking(&self) -> broadcast::Receiver<LinkingDecision> {
        self.inner.lists.subscribe()
    }

    /// Handle events of `channel` outside the pipeline.
    pub fn watch_manually(&self, channel: ChannelSnapshot) {
        let registry = self.inner.pipeline.registry();
        registry.register(channel.cid.clone());
        registry.cache_channel(channel);
    }

    /// Return events of `cid` to the pipeline.
    pub fn stop_watching_manually(&self, cid: &ChannelId) {
        self.inner.pipeline.registry().unregister(cid);
    }

    /// Manually handled channels.
    pub fn manual_events(&self) -> &Arc<ManualEventRegistry> {
        self.inner.pipeline.registry()
    }

    /// Observe a channel list.
    pub fn observe_list(
        &self,
        query: ListQuery,
        filter: Option<MembershipFilter>,
    ) -> Arc<ObservedList> {
        self.inner.lists.observe(query, filter)
    }

    /// Stop observing a channel list.
    pub fn stop_observing(&self, query_id: &str) {
        self.inner.lists.stop_observing(query_id);
    }

    /// Observed channel lists.
    pub fn lists(&self) -> &ChannelListRegistry {
        &self.inner.lists
    }

    /// Workers of the current user.
    pub fn workers(&self) -> Arc<Workers<S>> {
        self.inner.workers()
    }

    /// Replay missed events and reload the observed lists.
    pub async fn sync_local_state(&self) -> Result<(), SyncError> {
        self.inner.sync_local_state().await
    }

    /// Run events through the pipeline and the observed lists, as if
    /// they had been received.
    pub async fn process_events(&self, events: Vec<Event>) -> Vec<Event> {
        self.inner.process_received(events).await
    }

    /// The store.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// Credential repository.
    pub fn credentials(&self) -> &CredentialRepository {
        &self.inner.credentials
    }
}

impl<T: Transport, S: Store> Drop for ConnectionCoordinator<T, S> {
    fn drop(&mut self) {
        self.listener.abort();
        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }
        self.inner.credentials.cancel_refresh();
        self.inner.fail_waiters(&ClientError::Deallocated);
    }
}

impl<T: Transport, S: Store> std::fmt::Debug for ConnectionCoordinator<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCoordinator")
            .field("state", &self.inner.lock_machine().state)
            .field("active", &self.inner.config.active_mode)
            .finish()
    }
}

impl<T: Transport, S: Store> Inner<T, S> {
    fn lock_machine(&self) -> MutexGuard<'_, Machine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keep `task` so dropping the coordinator can abort it.
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn workers(&self) -> Arc<Workers<S>> {
        Arc::clone(
            &self
                .workers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Current session id, or a waiter for the next one.
    fn register_waiter(
        &self,
    ) -> Result<SessionId, oneshot::Receiver<Result<SessionId, ClientError>>> {
        let mut machine = self.lock_machine();
        if let Some(session_id) = machine.state.session_id() {
            return Ok(session_id.clone());
        }
        let (tx, rx) = oneshot::channel();
        machine.waiters.push(tx);
        Err(rx)
    }

    /// Apply `event` to the state machine.
    ///
    /// Waiters and status are handled here; the returned actions need I/O.
    fn transition(self: &Arc<Self>, event: StateEvent) -> Vec<Action> {
        let mut machine = self.lock_machine();
        let state = std::mem::take(&mut machine.state);
        let (next, actions) = state.on_event(event);
        machine.state = next;

        let mut pending = Vec::new();
        for action in actions {
            match action {
                Action::CompleteWaiters(outcome) => {
                    let result = match outcome {
                        WaiterOutcome::Session(session_id) => {
                            if self.ever_connected.swap(true, Ordering::SeqCst) {
                                self.spawn_local_sync();
                            }
                            tracing::info!("Connected with session {}", session_id);
                            Ok(session_id)
                        }
                        WaiterOutcome::Failed(error) => {
                            Err(ClientError::ConnectionNotSuccessful { error })
                        }
                    };
                    for waiter in machine.waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                }
                Action::EmitStatus(status) => {
                    tracing::debug!("Connection status: {:?}", status);
                    self.status.send_replace(status);
                }
                other => pending.push(other),
            }
        }
        pending
    }

    /// Run the I/O requested by a transition.
    async fn execute(self: &Arc<Self>, actions: Vec<Action>) -> Result<(), ClientError> {
        for action in actions {
            match action {
                Action::Connect => {
                    if let Err(e) = self.transport.connect().await {
                        tracing::warn!("Transport connect failed: {}", e);
                        self.transition(StateEvent::ConnectFailed { error: None });
                        return Err(e.into());
                    }
                }
                Action::Disconnect { source } => {
                    self.transport.disconnect(source.clone()).await?;
                    for followup in self.transition(StateEvent::Disconnected { source }) {
                        if let Action::RefreshExpiredCredential { error } = followup {
                            self.spawn_credential_recovery(error);
                        }
                    }
                }
                Action::RefreshExpiredCredential { error } => {
                    self.spawn_credential_recovery(error);
                }
                Action::CompleteWaiters(_) | Action::EmitStatus(_) => {}
            }
        }
        Ok(())
    }

    /// Record a disconnect this coordinator performed itself.
    fn confirm_disconnected(self: &Arc<Self>, source: DisconnectionSource) {
        let ignored = self.transition(StateEvent::Disconnected { source });
        if !ignored.is_empty() {
            tracing::debug!("Ignoring {} follow-up actions", ignored.len());
        }
    }

    fn fail_waiters(&self, error: &ClientError) {
        let waiters = std::mem::take(&mut self.lock_machine().waiters);
        if !waiters.is_empty() {
            tracing::debug!("Failing {} session waiters: {}", waiters.len(), error);
        }
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn set_endpoint(&self, credential: &Credential) {
        self.transport.set_connect_endpoint(ConnectEndpoint {
            base_url: self.config.base_url.clone(),
            api_key: self.config.api_key.clone(),
            user_id: credential.user.id.clone(),
            user_name: credential.user.name.clone(),
            token: credential.token.clone(),
        });
    }

    fn install(&self, credential: Credential) {
        let credential = self.credentials.install(credential);
        self.set_endpoint(&credential);
    }

    /// Drop everything belonging to the previous user.
    async fn reset_local_state(&self, user_id: &UserId) -> Result<(), ClientError> {
        self.pipeline.registry().clear();
        self.lists.clear_memberships();
        let user_id = user_id.clone();
        self.store
            .write_session(move |s| {
                s.remove_all();
                s.set_current_user(Some(user_id));
                Ok(())
            })
            .await?;
        let workers = Workers::new(&self.config, &self.api, &self.store, &self.pipeline);
        *self
            .workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(workers);
        self.ever_connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn process_received(&self, events: Vec<Event>) -> Vec<Event> {
        let missing =
            self.lists
                .missing_channels(self.store.as_ref(), self.pipeline.registry(), &events);
        if !missing.is_empty() {
            tracing::debug!("Loading {} channels unknown to the store", missing.len());
            if let Err(e) = self.workers().updater().fetch_channels(missing).await {
                tracing::warn!("Failed to load unknown channels: {}", e);
            }
        }

        let processed = self.pipeline.process(events, true).await;
        if !processed.is_empty() {
            self.lists.handle_events(self.store.as_ref(), &processed);
        }
        processed
    }

    async fn sync_local_state(&self) -> Result<(), SyncError> {
        let workers = self.workers();
        let mut cids: Vec<ChannelId> = self
            .store
            .read(|s| s.channels().into_iter().map(|c| c.cid).collect());
        cids.sort();
        let lists = self.lists.lists();
        workers
            .sync()
            .sync_local_state(&cids, &lists, workers.updater())
            .await
    }

    fn spawn_local_sync(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.sync_local_state().await {
                tracing::warn!("Local state sync after reconnect failed: {}", e);
            }
        }));
    }

    /// Refresh the token after the server closed the connection for it,
    /// then reconnect.
    fn spawn_credential_recovery(self: &Arc<Self>, error: ServerError) {
        let weak = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::info!("Token expired ({}), refreshing", error);
            match inner.credentials.refresh().await {
                Ok(credential) => {
                    inner.set_endpoint(&credential);
                    let actions = inner.transition(StateEvent::ConnectRequested);
                    if let Err(e) = inner.execute(actions).await {
                        tracing::warn!("Reconnect after token refresh failed: {}", e);
                    }
                }
                Err(e) => {
                    inner.fail_waiters(&e);
                    inner.status.send_replace(ConnectionStatus::Disconnected {
                        error: Some(error),
                    });
                }
            }
        }));
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let state_event = match event {
            TransportEvent::Connecting => StateEvent::TransportConnecting,
            TransportEvent::Opened => StateEvent::TransportOpened,
            TransportEvent::SessionAssigned(session_id) => StateEvent::SessionAssigned { session_id },
            TransportEvent::Closed(source) => {
                tracing::info!("Connection closed: {:?}", source);
                StateEvent::Disconnected { source }
            }
            TransportEvent::Received(events) => {
                self.process_received(events).await;
                return;
            }
        };
        let actions = self.transition(state_event);
        if let Err(e) = self.execute(actions).await {
            tracing::warn!("Failed to handle transport event: {}", e);
        }
    }
}

async fn wait_for_session(
    waiter: oneshot::Receiver<Result<SessionId, ClientError>>,
    timeout: Option<Duration>,
) -> Result<SessionId, ClientError> {
    let received = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, waiter).await {
            Ok(received) => received,
            Err(_) => return Err(ClientError::WaiterTimeout),
        },
        None => waiter.await,
    };
    // A dropped sender means the coordinator went away
    received.unwrap_or(Err(ClientError::Deallocated))
}

async fn listen<T: Transport, S: Store>(
    inner: Weak<Inner<T, S>>,
    mut events: broadcast::Receiver<TransportEvent>,
    mut session_ids: mpsc::UnboundedReceiver<SessionId>,
) {
    loop {
        tokio::select! {
            received = events.recv() => {
                let event = match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Listener lagged, skipped {} transport events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                inner.on_transport_event(event).await;
            }
            Some(session_id) = session_ids.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                let actions = inner.transition(StateEvent::SessionAssigned { session_id });
                if let Err(e) = inner.execute(actions).await {
                    tracing::warn!("Failed to apply health check: {}", e);
                }
            }
        }
    }
    tracing::debug!("Transport listener stopped");
}
