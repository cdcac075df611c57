//! State integration bridge.
//!
//! The only component that publishes into the host's state container.
//! It listens to [`EngineEvent`]s and turns each into at most one
//! [`Mutation`]. A ledger of what was already applied survives
//! re-attachment (e.g. after a hot reload), so replaying history or
//! receiving the same notification through both the cache and the
//! dispatcher path publishes it once. The ledger remembers a bounded
//! window of recent ids, sized from the engine's cache.
//!
//! When the bridge falls behind the engine's event channel it resyncs
//! from the cached history instead of dropping what it missed.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::ConnectionState;
use crate::constants::CACHE_CAPACITY;
use crate::engine::{EngineEvent, EngineView, NotificationEngine};
use crate::notification::{Notification, NotificationId};

/// Update published to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Mutation {
    /// A new notification.
    #[serde(rename_all = "camelCase")]
    NotificationReceived {
        /// The record.
        notification: Notification,
    },
    /// One notification was read.
    #[serde(rename_all = "camelCase")]
    NotificationRead {
        /// Its id.
        id: NotificationId,
    },
    /// Everything was read.
    AllNotificationsRead,
    /// The push connection changed state.
    #[serde(rename_all = "camelCase")]
    ConnectionStatusChanged {
        /// New state.
        status: ConnectionState,
    },
}

/// The host's state container, seen through its single entry point.
pub trait HostState: Send + Sync {
    /// Apply one mutation.
    fn publish(&self, mutation: Mutation);
}

/// Insertion-ordered id set that forgets the oldest id past `capacity`.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<NotificationId>,
    set: HashSet<NotificationId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if `id` was already present.
    fn insert(&mut self, id: NotificationId) -> bool {
        if !self.set.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        self.evict();
        true
    }

    fn contains(&self, id: &NotificationId) -> bool {
        self.set.contains(id)
    }

    fn iter(&self) -> impl Iterator<Item = &NotificationId> {
        self.order.iter()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }

    fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict();
    }

    fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}

#[derive(Debug)]
struct Ledger {
    received: RecentIds,
    read: RecentIds,
    status: Option<ConnectionState>,
}

impl Ledger {
    fn new(window: usize) -> Self {
        Self {
            received: RecentIds::new(window),
            read: RecentIds::new(window),
            status: None,
        }
    }

    fn resize(&mut self, window: usize) {
        self.received.resize(window);
        self.read.resize(window);
    }
}

/// Ledger window for a cache of `capacity`: ids outlive their cache entry.
fn window_for(capacity: usize) -> usize {
    capacity.saturating_mul(2)
}

/// Translates engine events into idempotent host mutations.
///
/// Cloning shares the ledger.
#[derive(Clone)]
pub struct StateBridge {
    host: Arc<dyn HostState>,
    ledger: Arc<Mutex<Ledger>>,
}

impl std::fmt::Debug for StateBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBridge")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl StateBridge {
    /// Bridge publishing into `host`.
    pub fn new(host: Arc<dyn HostState>) -> Self {
        Self {
            host,
            ledger: Arc::new(Mutex::new(Ledger::new(window_for(CACHE_CAPACITY)))),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one event. Returns the mutation published, if any.
    pub fn apply(&self, event: &EngineEvent) -> Option<Mutation> {
        let mutation = {
            translate(&mut self.ledger(), event)
        }?;
        log::debug!("[Bridge] Publishing {}", mutation_kind(&mutation));
        self.host.publish(mutation.clone());
        Some(mutation)
    }

    /// Publish whatever the host has not seen yet from `history` (oldest
    /// first) and the current connection state.
    pub fn replay<'a>(
        &self,
        history: impl DoubleEndedIterator<Item = &'a Notification>,
        status: &ConnectionState,
    ) {
        for notification in history.rev() {
            self.apply(&EngineEvent::Received {
                notification: notification.clone(),
                unread_count: 0,
            });
            if !notification.is_unread() {
                self.apply(&EngineEvent::Read {
                    id: notification.id.clone(),
                    unread_count: 0,
                });
            }
        }
        self.apply(&EngineEvent::ConnectionChanged(status.clone()));
    }

    /// Consume `events` on a background task until the sender is dropped.
    ///
    /// Events skipped because the receiver lagged are lost; use
    /// [`StateBridge::attach_to`] to resync from the engine instead.
    pub fn attach(&self, events: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
        self.follow(events, None)
    }

    fn follow(
        &self,
        mut events: broadcast::Receiver<EngineEvent>,
        view: Option<EngineView>,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        bridge.apply(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => match &view {
                        Some(view) => {
                            log::warn!("[Bridge] Lagged by {} events, resyncing from history", n);
                            let history = view.history();
                            bridge.replay(history.iter(), &view.connection_state());
                        }
                        None => log::warn!("[Bridge] Lagged, {} events skipped", n),
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        log::info!("[Bridge] Engine closed, detaching");
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe to `engine`, replay its current history, then follow it.
    ///
    /// Safe to call again after the host reloads; already applied
    /// mutations are not repeated.
    pub fn attach_to(&self, engine: &NotificationEngine) -> JoinHandle<()> {
        self.ledger().resize(window_for(engine.cache_capacity()));
        let events = engine.subscribe();
        let view = engine.view();
        let history = view.history();
        self.replay(history.iter(), &view.connection_state());
        self.follow(events, Some(view))
    }
}

fn translate(ledger: &mut Ledger, event: &EngineEvent) -> Option<Mutation> {
    match event {
        EngineEvent::Received { notification, .. }
        | EngineEvent::Dispatched { notification, .. } => {
            if !ledger.received.insert(notification.id.clone()) {
                return None;
            }
            Some(Mutation::NotificationReceived {
                notification: notification.clone(),
            })
        }
        EngineEvent::Read { id, .. } => {
            if !ledger.read.insert(id.clone()) {
                return None;
            }
            Some(Mutation::NotificationRead { id: id.clone() })
        }
        EngineEvent::AllRead { .. } => {
            let newly_read: Vec<_> = ledger
                .received
                .iter()
                .filter(|id| !ledger.read.contains(id))
                .cloned()
                .collect();
            for id in newly_read {
                ledger.read.insert(id);
            }
            Some(Mutation::AllNotificationsRead)
        }
        EngineEvent::HistoryCleared => {
            ledger.received.clear();
            ledger.read.clear();
            None
        }
        EngineEvent::ConnectionChanged(state) => {
            if ledger.status.as_ref() == Some(state) {
                return None;
            }
            ledger.status = Some(state.clone());
            Some(Mutation::ConnectionStatusChanged {
                status: state.clone(),
            })
        }
    }
}

fn mutation_kind(mutation: &Mutation) -> &'static str {
    match mutation {
        Mutation::NotificationReceived { .. } => "notificationReceived",
        Mutation::NotificationRead { .. } => "notificationRead",
        Mutation::AllNotificationsRead => "allNotificationsRead",
        Mutation::ConnectionStatusChanged { .. } => "connectionStatusChanged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchReport, SinkOutcome, SkipReason};
    use crate::notification::fixtures::notification;
    use crate::notification::Priority;

    #[derive(Default)]
    struct RecordingHost(Mutex<Vec<Mutation>>);

    impl HostState for RecordingHost {
        fn publish(&self, mutation: Mutation) {
            self.0.lock().unwrap().push(mutation);
        }
    }

    fn received(id: &str) -> EngineEvent {
        EngineEvent::Received {
            notification: notification(id, Priority::Medium, "info"),
            unread_count: 1,
        }
    }

    fn dispatched(id: &str) -> EngineEvent {
        let skipped = SinkOutcome::Skipped(SkipReason::NotInstalled);
        EngineEvent::Dispatched {
            notification: notification(id, Priority::Medium, "info"),
            report: DispatchReport {
                id: id.into(),
                system: skipped.clone(),
                sound: skipped.clone(),
                toast: skipped,
            },
        }
    }

    #[test]
    fn test_received_and_dispatched_publish_once() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());

        assert!(bridge.apply(&received("n1")).is_some());
        assert!(bridge.apply(&dispatched("n1")).is_none());
        assert!(bridge.apply(&received("n1")).is_none());

        assert_eq!(host.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_read_is_idempotent() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());
        let read = EngineEvent::Read {
            id: "n1".into(),
            unread_count: 0,
        };

        bridge.apply(&read);
        bridge.apply(&read);

        assert_eq!(
            *host.0.lock().unwrap(),
            vec![Mutation::NotificationRead { id: "n1".into() }]
        );
    }

    #[test]
    fn test_repeated_connection_state_is_collapsed() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());

        bridge.apply(&EngineEvent::ConnectionChanged(ConnectionState::Connecting));
        bridge.apply(&EngineEvent::ConnectionChanged(ConnectionState::Connecting));
        bridge.apply(&EngineEvent::ConnectionChanged(ConnectionState::Connected));

        assert_eq!(host.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_clone_shares_ledger_across_reattach() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());
        bridge.apply(&received("n1"));

        let reloaded = bridge.clone();
        let history = [notification("n1", Priority::Low, "info"), notification("n2", Priority::Low, "info")];
        reloaded.replay(history.iter(), &ConnectionState::Disconnected);

        let published = host.0.lock().unwrap().clone();
        assert_eq!(published.len(), 3);
        assert!(matches!(
            &published[1],
            Mutation::NotificationReceived { notification } if notification.id.as_str() == "n2"
        ));
    }

    #[test]
    fn test_replay_publishes_oldest_first_and_read_state() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());
        let mut old = notification("old", Priority::Low, "info");
        old.read_at = Some(chrono::Utc::now());
        let newest_first = [notification("new", Priority::Low, "info"), old];

        bridge.replay(newest_first.iter(), &ConnectionState::Connected);

        let kinds: Vec<_> = host.0.lock().unwrap().iter().map(mutation_kind).collect();
        assert_eq!(
            kinds,
            vec![
                "notificationReceived",
                "notificationRead",
                "notificationReceived",
                "connectionStatusChanged"
            ]
        );
    }

    #[test]
    fn test_mutation_serialization() {
        let json = serde_json::to_value(Mutation::ConnectionStatusChanged {
            status: ConnectionState::Reconnecting {
                attempt: 2,
                next_retry_ms: 2000,
            },
        })
        .unwrap();
        assert_eq!(json["kind"], "connectionStatusChanged");
        assert_eq!(json["status"]["status"], "reconnecting");
    }

    #[test]
    fn test_history_clear_resets_ledger() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());
        bridge.apply(&received("n1"));
        bridge.apply(&EngineEvent::HistoryCleared);

        assert!(bridge.apply(&received("n1")).is_some());
    }

    #[test]
    fn test_ledger_forgets_oldest_ids_past_window() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());
        bridge.ledger().resize(3);

        for id in ["n1", "n2", "n3", "n4", "n5"] {
            bridge.apply(&received(id));
            bridge.apply(&EngineEvent::Read {
                id: id.into(),
                unread_count: 0,
            });
        }

        {
            let ledger = bridge.ledger();
            assert_eq!(ledger.received.len(), 3);
            assert_eq!(ledger.read.len(), 3);
            assert!(!ledger.received.contains(&"n2".into()));
            assert!(ledger.received.contains(&"n5".into()));
        }
        // Recent ids are still deduplicated.
        assert!(bridge.apply(&received("n4")).is_none());
    }

    #[test]
    fn test_all_read_marks_only_tracked_ids() {
        let host = Arc::new(RecordingHost::default());
        let bridge = StateBridge::new(host.clone());
        bridge.apply(&received("n1"));
        bridge.apply(&received("n2"));

        bridge.apply(&EngineEvent::AllRead { changed: 2 });

        assert_eq!(bridge.ledger().read.len(), 2);
        let read_n1 = EngineEvent::Read {
            id: "n1".into(),
            unread_count: 0,
        };
        assert!(bridge.apply(&read_n1).is_none());
    }
}
