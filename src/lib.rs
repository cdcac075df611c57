//! Herald - real-time notification delivery engine.
//!
//! Keeps a persistent push connection to a notification source, normalizes
//! inbound events into one canonical record, keeps a bounded local history
//! and fans each new notification out to presentation sinks, while
//! surviving network loss and reconnects.
//!
//! # Architecture
//!
//! Components are constructed explicitly and wired by [`NotificationEngine`]:
//!
//! - **Connection** - connection lifecycle and reconnect backoff over a
//!   pluggable [`Transport`]
//! - **Normalizer** - raw frames to [`Notification`]s
//! - **Dispatcher** - routes each new notification to system, sound and
//!   toast sinks according to [`Preferences`]
//! - **Cache** - bounded, persisted history with an unread aggregate, plus
//!   the pending queue
//! - **Bridge** - the only publisher into the host's state container
//!
//! # Modules
//!
//! - [`connection`] - state machine, driver and transport traits
//! - [`cable`] - WebSocket transport used against a real server
//! - [`dispatch`] - dispatcher and sink traits
//! - [`cache`] - local history
//! - [`api`] - REST client for history and preferences
//! - [`config`] - configuration loading/saving

pub mod api;
pub mod bridge;
pub mod cable;
pub mod cache;
pub mod config;
pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod normalizer;
pub mod notification;
pub mod preferences;
pub mod ws;

// Re-export commonly used types
pub use api::{HistoryPage, HistoryQuery, NotificationApi};
pub use bridge::{HostState, Mutation, StateBridge};
pub use cable::CableTransport;
pub use cache::{LocalCache, PendingQueue};
pub use config::Config;
pub use connection::{ConnectionState, Credential, ReconnectPolicy, Transport, TransportSession};
pub use dispatch::Dispatcher;
pub use engine::{EngineEvent, EngineView, NotificationEngine};
pub use error::{ApiError, CacheError, ConnectionError, PresentationError};
pub use notification::{Notification, NotificationId, Priority};
pub use preferences::{DeliveryChannel, PreferenceStore, Preferences, PreferencesPatch};
