//! Composition root.
//!
//! [`NotificationEngine`] owns one instance of every component and wires
//! them together:
//!
//! ```text
//! Transport ──frames──▶ ingest task ──▶ normalize ──▶ LocalCache.upsert ──▶ Dispatcher
//!     ▲                                     │ (not ready)                  │
//! ConnectionManager                     PendingQueue                      │
//!     │ on_state_change                                                    ▼
//!     └──────────────────────────────▶ broadcast<EngineEvent> ──▶ StateBridge ──▶ host
//! ```
//!
//! Cache mutation, the unread aggregate and the dispatch of newly inserted
//! notifications happen under one lock, so dispatch order matches receipt
//! order and observers never see a stale aggregate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::api::{NotificationApi, TestReceipt};
use crate::cache::{LocalCache, PendingQueue};
use crate::connection::{
    ConnectionManager, ConnectionState, Credential, ReconnectPolicy, SharedConnectionState,
    Transport,
};
use crate::constants::{CACHE_CAPACITY, EVENT_CHANNEL_CAPACITY};
use crate::dispatch::{DispatchReport, Dispatcher, Toast};
use crate::error::{ApiError, ConnectionError};
use crate::normalizer;
use crate::notification::{Notification, NotificationId};
use crate::preferences::{DeliveryChannel, PreferenceStore, Preferences, PreferencesPatch};

/// Everything observable that happens inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A notification was inserted into the cache for the first time.
    Received {
        /// The new record.
        notification: Notification,
        /// Unread count after insertion.
        unread_count: usize,
    },
    /// A notification went through the dispatcher.
    Dispatched {
        /// The presented record.
        notification: Notification,
        /// Per-sink outcome.
        report: DispatchReport,
    },
    /// A notification was marked read.
    Read {
        /// Its id.
        id: NotificationId,
        /// Unread count afterwards.
        unread_count: usize,
    },
    /// Every notification was marked read.
    AllRead {
        /// How many entries changed.
        changed: usize,
    },
    /// The history was cleared.
    HistoryCleared,
    /// The connection changed state.
    ConnectionChanged(ConnectionState),
}

/// Builder for [`NotificationEngine`].
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    cache: Option<LocalCache>,
    dispatcher: Option<Dispatcher>,
    api: Option<NotificationApi>,
    presentation_ready: bool,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("policy", &self.policy)
            .field("cache", &self.cache)
            .field("dispatcher", &self.dispatcher)
            .field("api", &self.api)
            .field("presentation_ready", &self.presentation_ready)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Reconnect policy (defaults to [`ReconnectPolicy::default`]).
    #[must_use]
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Local cache (defaults to an in-memory cache of the default capacity).
    #[must_use]
    pub fn cache(mut self, cache: LocalCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Dispatcher with its sinks (defaults to one with no sinks).
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// REST client for preferences, test sends and read sync.
    #[must_use]
    pub fn api(mut self, api: NotificationApi) -> Self {
        self.api = Some(api);
        self
    }

    /// Whether the host can present notifications right away (default
    /// `true`). When `false`, notifications wait in the pending queue until
    /// [`NotificationEngine::set_presentation_ready`] is called.
    #[must_use]
    pub fn presentation_ready(mut self, ready: bool) -> Self {
        self.presentation_ready = ready;
        self
    }

    /// Spawn the connection driver and the ingest task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> NotificationEngine {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Dispatcher::new(PreferenceStore::default()));
        let shared = Arc::new(Shared {
            store: Mutex::new(Store {
                cache: self.cache.unwrap_or_else(|| LocalCache::new(CACHE_CAPACITY)),
                pending: PendingQueue::new(),
                presentation_ready: self.presentation_ready,
            }),
            preferences: dispatcher.preferences().clone(),
            dispatcher,
            api: self.api,
            events,
        });

        let connection = ConnectionManager::spawn(self.transport, self.policy, frames_tx);
        let state_events = shared.events.clone();
        connection.on_state_change(move |state| {
            // No receivers is fine.
            let _ = state_events.send(EngineEvent::ConnectionChanged(state.clone()));
        });

        let ingest = tokio::spawn(run_ingest(Arc::clone(&shared), frames_rx));

        NotificationEngine {
            connection,
            shared,
            ingest,
        }
    }
}

struct Store {
    cache: LocalCache,
    pending: PendingQueue,
    presentation_ready: bool,
}

struct Shared {
    store: Mutex<Store>,
    dispatcher: Dispatcher,
    preferences: PreferenceStore,
    api: Option<NotificationApi>,
    events: broadcast::Sender<EngineEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is not an error.
        let _ = self.events.send(event);
    }

    fn ingest(&self, notification: Notification) {
        let mut store = self.lock();
        if !store.presentation_ready {
            log::debug!("[Engine] Presentation not ready, queueing {}", notification.id);
            store.pending.enqueue(notification);
            return;
        }
        if store.cache.upsert(notification.clone()) {
            let unread_count = store.cache.unread_count();
            self.present(notification, unread_count);
        }
    }

    /// Announce and dispatch a freshly inserted notification. Called with
    /// the store lock held.
    fn present(&self, notification: Notification, unread_count: usize) {
        self.emit(EngineEvent::Received {
            notification: notification.clone(),
            unread_count,
        });
        let report = self.dispatcher.dispatch(&notification);
        self.emit(EngineEvent::Dispatched {
            notification,
            report,
        });
    }
}

async fn run_ingest(shared: Arc<Shared>, mut frames: mpsc::UnboundedReceiver<Value>) {
    while let Some(frame) = frames.recv().await {
        for notification in normalizer::normalize(&frame) {
            shared.ingest(notification);
        }
    }
    log::debug!("[Engine] Frame channel closed, ingest stopped");
}

/// Read-only handle on the engine's history and connection state.
///
/// Cheap to clone and usable from other tasks; used by the bridge to
/// resynchronize after it falls behind the event stream. It does not keep
/// the engine alive.
#[derive(Clone)]
pub struct EngineView {
    shared: Weak<Shared>,
    connection: Weak<SharedConnectionState>,
}

impl std::fmt::Debug for EngineView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineView")
            .field("connection", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl EngineView {
    /// Cached notifications, newest first. Empty once the engine is gone.
    pub fn history(&self) -> Vec<Notification> {
        self.shared
            .upgrade()
            .map(|shared| shared.lock().cache.list().cloned().collect())
            .unwrap_or_default()
    }

    /// Current connection state; `Disconnected` once the engine is gone.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .upgrade()
            .map_or(ConnectionState::Disconnected, |state| state.get())
    }
}

/// The notification engine.
///
/// Dropping it stops the connection driver and the ingest task.
pub struct NotificationEngine {
    connection: ConnectionManager,
    shared: Arc<Shared>,
    ingest: JoinHandle<()>,
}

impl std::fmt::Debug for NotificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("connection", &self.connection)
            .field("unread", &self.unread_count())
            .finish_non_exhaustive()
    }
}

impl NotificationEngine {
    /// Start building an engine on top of `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder {
            transport,
            policy: ReconnectPolicy::default(),
            cache: None,
            dispatcher: None,
            api: None,
            presentation_ready: true,
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Read-only handle on history and connection state.
    pub fn view(&self) -> EngineView {
        EngineView {
            shared: Arc::downgrade(&self.shared),
            connection: Arc::downgrade(&self.connection.shared_state()),
        }
    }

    /// Maximum number of cached notifications.
    pub fn cache_capacity(&self) -> usize {
        self.shared.lock().cache.capacity()
    }

    // ---------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------

    /// Open the push connection.
    ///
    /// # Errors
    ///
    /// `ConnectionError::AuthMissing` if `credential` is blank.
    pub fn connect(&self, credential: Credential) -> Result<(), ConnectionError> {
        self.connection.connect(credential)
    }

    /// Close the push connection and cancel pending reconnects.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Host signal: network lost.
    pub fn network_offline(&self) {
        self.connection.network_offline();
    }

    /// Host signal: network restored.
    pub fn network_online(&self) {
        self.connection.network_online();
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Register a listener for connection state transitions.
    pub fn on_state_change(&self, listener: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.connection.on_state_change(listener);
    }

    // ---------------------------------------------------------------
    // History
    // ---------------------------------------------------------------

    /// Mark `id` read. Returns `true` if it was unread.
    ///
    /// When an API client is configured the server is updated in the
    /// background; failures there are logged.
    pub fn mark_as_read(&self, id: &NotificationId) -> bool {
        let changed = {
            let mut store = self.shared.lock();
            let changed = store.cache.mark_read(id);
            if changed {
                self.shared.emit(EngineEvent::Read {
                    id: id.clone(),
                    unread_count: store.cache.unread_count(),
                });
            }
            changed
        };

        if changed {
            if let Some(api) = self.shared.api.clone() {
                let id = id.clone();
                spawn_sync("mark read", async move { api.mark_read(&id).await });
            }
        }
        changed
    }

    /// Mark everything read. Returns how many entries changed.
    pub fn mark_all_as_read(&self) -> usize {
        let changed = {
            let mut store = self.shared.lock();
            let changed = store.cache.mark_all_read();
            if changed > 0 {
                self.shared.emit(EngineEvent::AllRead { changed });
            }
            changed
        };

        if changed > 0 {
            if let Some(api) = self.shared.api.clone() {
                spawn_sync("mark all read", async move { api.mark_all_read().await });
            }
        }
        changed
    }

    /// Number of unread cached notifications.
    pub fn unread_count(&self) -> usize {
        self.shared.lock().cache.unread_count()
    }

    /// Cached notifications, newest first.
    pub fn history(&self) -> Vec<Notification> {
        self.shared.lock().cache.list().cloned().collect()
    }

    /// Look up one cached notification.
    pub fn get(&self, id: &NotificationId) -> Option<Notification> {
        self.shared.lock().cache.get(id).cloned()
    }

    /// Drop the local history.
    pub fn clear_history(&self) {
        let mut store = self.shared.lock();
        store.cache.clear();
        self.shared.emit(EngineEvent::HistoryCleared);
    }

    /// Number of notifications waiting for presentation.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    // ---------------------------------------------------------------
    // Presentation
    // ---------------------------------------------------------------

    /// Tell the engine whether the host can present notifications.
    ///
    /// Switching to ready replays the pending queue in arrival order:
    /// each entry is upserted and the new ones are dispatched.
    pub fn set_presentation_ready(&self, ready: bool) {
        let mut store = self.shared.lock();
        let was_ready = store.presentation_ready;
        store.presentation_ready = ready;
        if !ready || was_ready {
            return;
        }

        let Store { cache, pending, .. } = &mut *store;
        let queued = pending.len();
        let inserted = pending.drain_into(cache);
        log::info!(
            "[Engine] Presentation ready, replaying {} of {} pending notifications",
            inserted.len(),
            queued
        );
        for (notification, unread_count) in inserted {
            self.shared.present(notification, unread_count);
        }
    }

    /// Handle a click on `toast`. Returns `true` if navigation happened.
    pub fn toast_clicked(&self, toast: &Toast) -> bool {
        self.shared.dispatcher.toast_clicked(toast)
    }

    // ---------------------------------------------------------------
    // Preferences and test channel
    // ---------------------------------------------------------------

    /// Last known preferences.
    pub fn preferences(&self) -> Preferences {
        self.shared.preferences.snapshot()
    }

    /// Fetch preferences from the server and make them current.
    ///
    /// # Errors
    ///
    /// `ApiError::NotConfigured` without an API client, otherwise whatever
    /// the server call returned.
    pub async fn refresh_preferences(&self) -> Result<Preferences, ApiError> {
        let api = self.api()?;
        let preferences = api.get_preferences().await?;
        self.shared.preferences.replace(preferences.clone());
        Ok(preferences)
    }

    /// Send a partial update and adopt the merged result.
    ///
    /// # Errors
    ///
    /// `ApiError::NotConfigured` without an API client, otherwise whatever
    /// the server call returned. Local preferences are left untouched on
    /// failure.
    pub async fn update_preferences(
        &self,
        patch: &PreferencesPatch,
    ) -> Result<Preferences, ApiError> {
        let api = self.api()?;
        let preferences = api.update_preferences(patch).await?;
        self.shared.preferences.replace(preferences.clone());
        Ok(preferences)
    }

    /// Ask the server for a synthetic notification over `channels`.
    ///
    /// # Errors
    ///
    /// `ApiError::NotConfigured` without an API client, otherwise whatever
    /// the server call returned.
    pub async fn send_test(&self, channels: &[DeliveryChannel]) -> Result<TestReceipt, ApiError> {
        self.api()?.send_test(channels).await
    }

    fn api(&self) -> Result<&NotificationApi, ApiError> {
        self.shared.api.as_ref().ok_or(ApiError::NotConfigured)
    }
}

impl Drop for NotificationEngine {
    fn drop(&mut self) {
        self.ingest.abort();
    }
}

/// Run a best-effort server sync in the background.
fn spawn_sync<F>(what: &'static str, sync: F)
where
    F: std::future::Future<Output = Result<(), ApiError>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = sync.await {
                    log::warn!("[Engine] Server sync ({}) failed: {}", what, e);
                }
            });
        }
        Err(_) => log::debug!("[Engine] No runtime, skipping server sync ({})", what),
    }
}
