//! Transport connection management.
//!
//! Owns the single logical connection to the notification source,
//! authenticates it and keeps it alive.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager (handle, Clone-free, owned by the engine)
//!     │  commands: connect / disconnect / offline / online
//!     ▼
//! driver task ──── ConnectionMachine (pure: events in, actions out)
//!     │                 └── ReconnectPolicy (backoff schedule)
//!     ├── retry timer (at most one)
//!     └── session task per attempt ── Transport::open → join → next_frame…
//!                                          │
//!                                          └── raw frames → engine
//! ```
//!
//! Consumers observe connectivity only through [`ConnectionState`]
//! transitions, either by polling [`SharedConnectionState::get`] or by
//! registering a listener with [`SharedConnectionState::subscribe`].

pub mod machine;
pub mod manager;
pub mod policy;

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use crate::constants::DEFAULT_ROLE;
use crate::error::ConnectionError;

/// Connection state as observed by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; no automatic transition happens from here.
    #[default]
    Disconnected,
    /// First attempt in progress after a manual connect or coming back online.
    Connecting,
    /// Connected and joined.
    Connected,
    /// Waiting to retry, or retrying, after an unexpected loss.
    Reconnecting {
        /// Consecutive failures so far.
        attempt: u32,
        /// Delay before the next attempt.
        next_retry_ms: u64,
    },
    /// The host reported the network as down; attempts are suspended.
    Offline,
    /// Gave up. A manual `connect` is required to resume.
    Failed {
        /// Why the connection gave up.
        reason: String,
    },
}

impl ConnectionState {
    /// Short status name, as published to the host.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Offline => "offline",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether this state needs a manual retry to leave.
    ///
    /// Distinguishes `failed` from the transient `offline`/`reconnecting`.
    #[must_use]
    pub fn needs_manual_retry(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Whether the state machine will never leave this state on its own.
    #[must_use]
    pub fn is_resting(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconnecting {
                attempt,
                next_retry_ms,
            } => write!(f, "reconnecting (attempt {attempt}, retry in {next_retry_ms}ms)"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Bearer credential plus the role used to scope the channel join.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    role: Option<String>,
}

impl Credential {
    /// Create a credential from a bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            role: None,
        }
    }

    /// Scope the channel join to `role`.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let role = role.into();
        self.role = (!role.is_empty()).then_some(role);
        self
    }

    /// The bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The authenticated identity's role, if known.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Whether the token is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty()
    }

    /// Room joined once connected: `notifications:<role>`.
    #[must_use]
    pub fn room(&self) -> String {
        format!("notifications:{}", self.role().unwrap_or(DEFAULT_ROLE))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

/// Something that can open an authenticated session to the notification source.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open and authenticate a session.
    ///
    /// # Errors
    ///
    /// `ConnectionError::AuthRejected` when the source refuses the
    /// credential, `ConnectionError::Transport` for anything recoverable.
    async fn open(&self, credential: &Credential)
        -> Result<Box<dyn TransportSession>, ConnectionError>;
}

/// One live session. Dropping it tears the underlying connection down.
#[async_trait]
pub trait TransportSession: Send {
    /// Request to join `room`. Failures are logged by the caller and do
    /// not affect the connection state.
    async fn join(&mut self, room: &str) -> Result<(), ConnectionError>;

    /// Next inbound payload frame.
    ///
    /// Returns `None` when the source closed the session normally.
    async fn next_frame(&mut self) -> Option<Result<serde_json::Value, ConnectionError>>;
}

/// Listener invoked on every connection state transition.
pub type StateListener = Box<dyn Fn(&ConnectionState) + Send + Sync>;

/// Connection state shared between the driver and its observers.
#[derive(Default)]
pub struct SharedConnectionState {
    state: RwLock<ConnectionState>,
    listeners: Mutex<Vec<StateListener>>,
}

impl std::fmt::Debug for SharedConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnectionState")
            .field("state", &self.get())
            .finish_non_exhaustive()
    }
}

impl SharedConnectionState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub fn get(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.get(), ConnectionState::Connected)
    }

    /// Register a listener for every subsequent transition.
    ///
    /// Listeners run synchronously on the driver task, in registration
    /// order. They must not call back into `subscribe`.
    pub fn subscribe(&self, listener: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Set the state and notify listeners.
    pub(crate) fn set(&self, new_state: ConnectionState) {
        *self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = new_state.clone();

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&new_state);
        }
    }
}

pub use machine::{Action, ConnectionMachine, Event};
pub use manager::ConnectionManager;
pub use policy::ReconnectPolicy;
