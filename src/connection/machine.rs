//! Pure connection state machine.
//!
//! The machine owns every connectivity decision: when to open a session,
//! when to back off, when to give up. It performs no I/O and never sleeps;
//! callers feed it [`Event`]s and manual commands and execute the returned
//! [`Action`]s in order. This keeps the reconnection policy testable
//! without a runtime.
//!
//! # Transitions
//!
//! ```text
//! disconnected ──connect──► connecting ──opened──► connected
//!                               │                      │ lost
//!                               └──lost──► reconnecting ◄┘
//!                                           │   ▲  │
//!                              retry due ───┘   │  └── max attempts / auth rejected ──► failed
//!                                           lost┘
//! connected|connecting|reconnecting ──offline──► offline ──online──► connecting
//! any ──disconnect──► disconnected
//! ```
//!
//! Every session attempt gets a fresh epoch. Session events carry the epoch
//! they were produced under; events from an older epoch are ignored, so a
//! torn-down session can never move the state.

use std::time::Duration;

use super::policy::ReconnectPolicy;
use super::{ConnectionState, Credential};
use crate::error::ConnectionError;

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The session for `epoch` is open and authenticated.
    Opened {
        /// Session epoch.
        epoch: u64,
    },
    /// The session for `epoch` failed to open, errored or closed.
    Lost {
        /// Session epoch.
        epoch: u64,
        /// Why it was lost.
        error: ConnectionError,
    },
    /// The scheduled retry timer fired.
    RetryDue,
    /// The host reported the network as unavailable.
    NetworkOffline,
    /// The host reported the network as available again.
    NetworkOnline,
}

/// Side effect requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a session attempt tagged with `epoch`.
    Open {
        /// Epoch for events produced by this attempt.
        epoch: u64,
        /// Credential to authenticate with.
        credential: Credential,
    },
    /// Tear down the current session, if any.
    Teardown,
    /// Arm the (single) retry timer.
    ScheduleRetry(Duration),
    /// Disarm the retry timer.
    CancelRetry,
    /// Publish a state transition.
    Transition(ConnectionState),
}

/// Connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    failures: u32,
    credential: Option<Credential>,
    epoch: u64,
    retry_armed: bool,
    /// Epoch of the attempt forced by `network_online`, while in flight.
    forced_epoch: Option<u64>,
}

impl ConnectionMachine {
    /// Create a machine in `disconnected`.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
            credential: None,
            epoch: 0,
            retry_armed: false,
            forced_epoch: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Consecutive failures counted toward the reconnect cap.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Epoch of the current (or most recent) session attempt.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a retry timer is armed.
    pub fn retry_armed(&self) -> bool {
        self.retry_armed
    }

    /// Manual connect.
    ///
    /// No-op while connected, connecting or reconnecting. While offline the
    /// credential is remembered for when the network returns. From
    /// `disconnected` or `failed` the failure counter resets and a fresh
    /// attempt starts.
    ///
    /// # Errors
    ///
    /// `ConnectionError::AuthMissing` if the credential is blank; the
    /// attempt is skipped, not retried.
    pub fn connect(&mut self, credential: Credential) -> Result<Vec<Action>, ConnectionError> {
        if credential.is_empty() {
            return Err(ConnectionError::AuthMissing);
        }

        match self.state {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting { .. } => Ok(Vec::new()),
            ConnectionState::Offline => {
                self.credential = Some(credential);
                Ok(Vec::new())
            }
            ConnectionState::Disconnected | ConnectionState::Failed { .. } => {
                self.failures = 0;
                self.credential = Some(credential);
                let mut actions = vec![self.transition(ConnectionState::Connecting)];
                actions.extend(self.open());
                Ok(actions)
            }
        }
    }

    /// Manual disconnect. Cancels any pending retry and resets the counter.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.epoch += 1;
        self.failures = 0;
        self.retry_armed = false;
        self.forced_epoch = None;
        self.credential = None;

        let mut actions = vec![Action::CancelRetry, Action::Teardown];
        if self.state != ConnectionState::Disconnected {
            actions.push(self.transition(ConnectionState::Disconnected));
        }
        actions
    }

    /// Feed an event and collect the resulting actions.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Opened { epoch } => self.on_opened(epoch),
            Event::Lost { epoch, error } => self.on_lost(epoch, error),
            Event::RetryDue => self.on_retry_due(),
            Event::NetworkOffline => self.on_offline(),
            Event::NetworkOnline => self.on_online(),
        }
    }

    fn on_opened(&mut self, epoch: u64) -> Vec<Action> {
        if epoch != self.epoch {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                self.failures = 0;
                self.forced_epoch = None;
                vec![self.transition(ConnectionState::Connected)]
            }
            _ => Vec::new(),
        }
    }

    fn on_lost(&mut self, epoch: u64, error: ConnectionError) -> Vec<Action> {
        if epoch != self.epoch {
            return Vec::new();
        }
        if !matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting { .. }
        ) {
            return Vec::new();
        }

        // The session behind this epoch is finished either way.
        let forced = self.forced_epoch.take() == Some(epoch);
        self.epoch += 1;
        self.retry_armed = false;

        if !error.is_recoverable() {
            self.credential = None;
            return vec![
                Action::Teardown,
                self.transition(ConnectionState::Failed {
                    reason: error.to_string(),
                }),
            ];
        }

        if !forced {
            self.failures += 1;
        }
        if self.policy.is_exhausted(self.failures) {
            return vec![
                Action::Teardown,
                self.transition(ConnectionState::Failed {
                    reason: format!("gave up after {} attempts: {}", self.failures, error),
                }),
            ];
        }

        // A failed forced attempt with no prior failures still waits one
        // base delay before retrying.
        let attempt = self.failures.max(1);
        let delay = self.policy.delay_for(attempt);
        self.retry_armed = true;
        vec![
            Action::Teardown,
            self.transition(ConnectionState::Reconnecting {
                attempt,
                next_retry_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            }),
            Action::ScheduleRetry(delay),
        ]
    }

    fn on_retry_due(&mut self) -> Vec<Action> {
        if !self.retry_armed || !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return Vec::new();
        }
        self.retry_armed = false;
        self.open().into_iter().collect()
    }

    fn on_offline(&mut self) -> Vec<Action> {
        if self.state.is_resting() || self.state == ConnectionState::Offline {
            return Vec::new();
        }
        self.epoch += 1;
        self.retry_armed = false;
        self.forced_epoch = None;
        vec![
            Action::CancelRetry,
            Action::Teardown,
            self.transition(ConnectionState::Offline),
        ]
    }

    fn on_online(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Offline {
            return Vec::new();
        }
        if self.credential.is_none() {
            return vec![self.transition(ConnectionState::Disconnected)];
        }
        // Forced attempt: neither the attempt nor its failure counts toward
        // the reconnect cap, so a flapping network cannot exhaust it.
        let mut actions = vec![self.transition(ConnectionState::Connecting)];
        actions.extend(self.open());
        self.forced_epoch = Some(self.epoch);
        actions
    }

    fn open(&mut self) -> Option<Action> {
        let credential = self.credential.clone()?;
        self.epoch += 1;
        Some(Action::Open {
            epoch: self.epoch,
            credential,
        })
    }

    fn transition(&mut self, next: ConnectionState) -> Action {
        self.state = next.clone();
        Action::Transition(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::default())
    }

    fn transport_error() -> ConnectionError {
        ConnectionError::Transport("connection reset".into())
    }

    fn open_epoch(actions: &[Action]) -> u64 {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Open { epoch, .. } => Some(*epoch),
                _ => None,
            })
            .expect("expected an Open action")
    }

    fn scheduled(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::ScheduleRetry(d) => Some(*d),
            _ => None,
        })
    }

    /// Drive a machine from `connect` to `connected`.
    fn connected() -> ConnectionMachine {
        let mut m = machine();
        let actions = m.connect(Credential::new("token")).unwrap();
        let epoch = open_epoch(&actions);
        m.handle(Event::Opened { epoch });
        assert_eq!(m.state(), &ConnectionState::Connected);
        m
    }

    #[test]
    fn test_connect_opens_session() {
        let mut m = machine();
        let actions = m.connect(Credential::new("token")).unwrap();

        assert_eq!(actions[0], Action::Transition(ConnectionState::Connecting));
        assert!(matches!(actions[1], Action::Open { epoch: 1, .. }));
    }

    #[test]
    fn test_connect_without_credential_is_skipped() {
        let mut m = machine();
        assert_eq!(
            m.connect(Credential::new("")),
            Err(ConnectionError::AuthMissing)
        );
        assert_eq!(m.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut m = machine();
        m.connect(Credential::new("token")).unwrap();
        assert!(m.connect(Credential::new("token")).unwrap().is_empty());

        let mut m = connected();
        assert!(m.connect(Credential::new("token")).unwrap().is_empty());
    }

    #[test]
    fn test_backoff_schedule_then_failed() {
        let mut m = machine();
        let mut epoch = open_epoch(&m.connect(Credential::new("token")).unwrap());
        let mut delays = Vec::new();

        for _ in 0..5 {
            let actions = m.handle(Event::Lost {
                epoch,
                error: transport_error(),
            });
            match scheduled(&actions) {
                Some(delay) => {
                    delays.push(delay.as_millis());
                    epoch = open_epoch(&m.handle(Event::RetryDue));
                }
                None => break,
            }
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
        assert!(m.state().needs_manual_retry());
        assert!(!m.retry_armed());
        assert_eq!(m.failures(), 5);
        // Nothing further happens on its own.
        assert!(m.handle(Event::RetryDue).is_empty());
    }

    #[test]
    fn test_reconnecting_state_reports_attempt() {
        let mut m = connected();
        m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        assert_eq!(
            m.state(),
            &ConnectionState::Reconnecting {
                attempt: 1,
                next_retry_ms: 1000
            }
        );
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let mut m = connected();
        m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        let epoch = open_epoch(&m.handle(Event::RetryDue));
        m.handle(Event::Opened { epoch });

        assert_eq!(m.state(), &ConnectionState::Connected);
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_auth_rejection_is_terminal() {
        let mut m = machine();
        let epoch = open_epoch(&m.connect(Credential::new("bad")).unwrap());

        let actions = m.handle(Event::Lost {
            epoch,
            error: ConnectionError::AuthRejected("unauthorized".into()),
        });

        assert!(scheduled(&actions).is_none());
        assert!(m.state().needs_manual_retry());
        assert!(m.handle(Event::RetryDue).is_empty());
    }

    #[test]
    fn test_manual_connect_from_failed_resets_counter() {
        let mut m = machine();
        let epoch = open_epoch(&m.connect(Credential::new("bad")).unwrap());
        m.handle(Event::Lost {
            epoch,
            error: ConnectionError::AuthRejected("nope".into()),
        });

        let actions = m.connect(Credential::new("good")).unwrap();
        assert!(actions.contains(&Action::Transition(ConnectionState::Connecting)));
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_disconnect_cancels_retry_and_resets() {
        let mut m = connected();
        m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        assert!(m.retry_armed());

        let actions = m.disconnect();

        assert!(actions.contains(&Action::CancelRetry));
        assert!(actions.contains(&Action::Transition(ConnectionState::Disconnected)));
        assert_eq!(m.failures(), 0);
        assert!(m.handle(Event::RetryDue).is_empty());
    }

    #[test]
    fn test_stale_session_events_are_ignored() {
        let mut m = connected();
        let old_epoch = m.epoch();
        m.disconnect();
        let epoch = open_epoch(&m.connect(Credential::new("token")).unwrap());

        assert!(m
            .handle(Event::Lost {
                epoch: old_epoch,
                error: transport_error()
            })
            .is_empty());
        assert_eq!(m.state(), &ConnectionState::Connecting);

        m.handle(Event::Opened { epoch });
        assert_eq!(m.state(), &ConnectionState::Connected);
    }

    #[test]
    fn test_duplicate_loss_counts_once() {
        let mut m = connected();
        let epoch = m.epoch();
        m.handle(Event::Lost {
            epoch,
            error: transport_error(),
        });
        m.handle(Event::Lost {
            epoch,
            error: transport_error(),
        });
        assert_eq!(m.failures(), 1);
    }

    #[test]
    fn test_offline_suspends_and_online_forces_one_attempt() {
        let mut m = connected();
        m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        assert_eq!(m.failures(), 1);

        let actions = m.handle(Event::NetworkOffline);
        assert!(actions.contains(&Action::CancelRetry));
        assert_eq!(m.state(), &ConnectionState::Offline);
        assert!(m.handle(Event::RetryDue).is_empty());

        let actions = m.handle(Event::NetworkOnline);
        let opens = actions
            .iter()
            .filter(|a| matches!(a, Action::Open { .. }))
            .count();
        assert_eq!(opens, 1);
        assert_eq!(m.state(), &ConnectionState::Connecting);
        assert_eq!(m.failures(), 1);
    }

    #[test]
    fn test_failed_forced_attempt_keeps_counter() {
        let mut m = connected();
        m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        assert_eq!(m.failures(), 1);

        // Far more flaps than max_attempts: forced failures never count.
        for _ in 0..10 {
            m.handle(Event::NetworkOffline);
            m.handle(Event::NetworkOnline);
            let actions = m.handle(Event::Lost {
                epoch: m.epoch(),
                error: transport_error(),
            });
            assert!(actions.contains(&Action::ScheduleRetry(Duration::from_millis(1000))));
            assert_eq!(m.failures(), 1);
            assert_eq!(
                m.state(),
                &ConnectionState::Reconnecting {
                    attempt: 1,
                    next_retry_ms: 1000
                }
            );
        }

        // The scheduled retry is an ordinary attempt again.
        m.handle(Event::RetryDue);
        m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        assert_eq!(m.failures(), 2);
    }

    #[test]
    fn test_forced_attempt_from_clean_state_waits_base_delay() {
        let mut m = connected();
        m.handle(Event::NetworkOffline);
        m.handle(Event::NetworkOnline);
        let actions = m.handle(Event::Lost {
            epoch: m.epoch(),
            error: transport_error(),
        });
        assert_eq!(m.failures(), 0);
        assert!(actions.contains(&Action::ScheduleRetry(Duration::from_millis(1000))));
    }

    #[test]
    fn test_offline_ignored_when_resting() {
        let mut m = machine();
        assert!(m.handle(Event::NetworkOffline).is_empty());
        assert_eq!(m.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_while_offline_waits_for_network() {
        let mut m = connected();
        m.handle(Event::NetworkOffline);
        assert!(m.connect(Credential::new("fresh")).unwrap().is_empty());

        let actions = m.handle(Event::NetworkOnline);
        let credential = actions.iter().find_map(|a| match a {
            Action::Open { credential, .. } => Some(credential.clone()),
            _ => None,
        });
        assert_eq!(credential, Some(Credential::new("fresh")));
    }
}
