//! Async driver for [`ConnectionMachine`].
//!
//! A single background task owns the machine, the retry timer and the
//! current session task. Commands from the handle, events from sessions
//! and the timer are processed one at a time in a `select!` loop, so the
//! machine never observes interleaved updates.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::machine::{Action, ConnectionMachine, Event};
use super::policy::ReconnectPolicy;
use super::{ConnectionState, Credential, SharedConnectionState, Transport};
use crate::error::ConnectionError;

/// Manual commands sent from the handle to the driver task.
#[derive(Debug)]
enum Command {
    Connect(Credential),
    Disconnect,
    NetworkOffline,
    NetworkOnline,
}

/// Events produced by a session task, tagged with its epoch.
#[derive(Debug)]
enum SessionEvent {
    Opened { epoch: u64 },
    Frame { epoch: u64, frame: serde_json::Value },
    Lost { epoch: u64, error: ConnectionError },
}

/// Handle to the connection driver.
///
/// Dropping the handle stops the driver and tears down the session.
#[derive(Debug)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SharedConnectionState>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the driver task. Inbound payload frames are forwarded to
    /// `frames` in receipt order.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        frames: mpsc::UnboundedSender<serde_json::Value>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = SharedConnectionState::new();

        let task = tokio::spawn(run_driver(
            ConnectionMachine::new(policy),
            transport,
            Arc::clone(&state),
            command_rx,
            frames,
        ));

        Self {
            commands,
            state,
            task,
        }
    }

    /// Connect with `credential`. No-op if already connected or connecting.
    ///
    /// # Errors
    ///
    /// `ConnectionError::AuthMissing` if the credential is blank; no
    /// attempt is made.
    pub fn connect(&self, credential: Credential) -> Result<(), ConnectionError> {
        if credential.is_empty() {
            log::warn!("[Connection] connect() without credential, skipping");
            return Err(ConnectionError::AuthMissing);
        }
        self.send(Command::Connect(credential));
        Ok(())
    }

    /// Tear down the connection and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Host signal: the network went away.
    pub fn network_offline(&self) {
        self.send(Command::NetworkOffline);
    }

    /// Host signal: the network is back.
    pub fn network_online(&self) {
        self.send(Command::NetworkOnline);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Shared state for external observation.
    pub fn shared_state(&self) -> Arc<SharedConnectionState> {
        Arc::clone(&self.state)
    }

    /// Register a listener invoked on every state transition.
    pub fn on_state_change(&self, listener: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.state.subscribe(listener);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("[Connection] Driver task is gone, command dropped");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the session task so it is aborted with the driver.
struct SessionSlot(Option<JoinHandle<()>>);

impl SessionSlot {
    fn replace(&mut self, handle: JoinHandle<()>) {
        self.teardown();
        self.0 = Some(handle);
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_driver(
    mut machine: ConnectionMachine,
    transport: Arc<dyn Transport>,
    state: Arc<SharedConnectionState>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::UnboundedSender<serde_json::Value>,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut session = SessionSlot(None);
    let mut retry_at: Option<Instant> = None;

    loop {
        let actions = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connect(credential)) => match machine.connect(credential) {
                    Ok(actions) => actions,
                    Err(e) => {
                        log::warn!("[Connection] connect rejected: {}", e);
                        Vec::new()
                    }
                },
                Some(Command::Disconnect) => machine.disconnect(),
                Some(Command::NetworkOffline) => machine.handle(Event::NetworkOffline),
                Some(Command::NetworkOnline) => machine.handle(Event::NetworkOnline),
                None => {
                    log::debug!("[Connection] Handle dropped, stopping driver");
                    break;
                }
            },

            Some(event) = events_rx.recv() => match event {
                SessionEvent::Opened { epoch } => machine.handle(Event::Opened { epoch }),
                SessionEvent::Lost { epoch, error } => machine.handle(Event::Lost { epoch, error }),
                SessionEvent::Frame { epoch, frame } => {
                    if epoch == machine.epoch() && frames.send(frame).is_err() {
                        log::warn!("[Connection] Frame consumer is gone, dropping frame");
                    }
                    Vec::new()
                }
            },

            () = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                retry_at = None;
                machine.handle(Event::RetryDue)
            }
        };

        for action in actions {
            match action {
                Action::Open { epoch, credential } => {
                    log::info!("[Connection] Opening session (epoch {})", epoch);
                    session.replace(tokio::spawn(run_session(
                        Arc::clone(&transport),
                        credential,
                        epoch,
                        events_tx.clone(),
                    )));
                }
                Action::Teardown => session.teardown(),
                Action::ScheduleRetry(delay) => {
                    log::info!("[Connection] Reconnecting in {}ms", delay.as_millis());
                    retry_at = Some(Instant::now() + delay);
                }
                Action::CancelRetry => retry_at = None,
                Action::Transition(next) => {
                    log::info!("[Connection] State -> {}", next);
                    state.set(next);
                }
            }
        }
    }
}

/// Reports the end of a session task to the driver.
///
/// If the task ends without an explicit report (a panic in the transport,
/// say), dropping the guard reports a transport loss so the machine backs
/// off instead of staying `connected`. Reports from aborted sessions carry a
/// stale epoch and are ignored by the machine.
struct SessionReporter {
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    reported: bool,
}

impl SessionReporter {
    /// Forward an event; `false` once the driver is gone.
    fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn lost(&mut self, error: ConnectionError) {
        self.reported = true;
        let _ = self.events.send(SessionEvent::Lost {
            epoch: self.epoch,
            error,
        });
    }
}

impl Drop for SessionReporter {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.events.send(SessionEvent::Lost {
                epoch: self.epoch,
                error: ConnectionError::Transport("session task ended unexpectedly".into()),
            });
        }
    }
}

/// One session attempt: open, join, then pump frames until the session ends.
async fn run_session(
    transport: Arc<dyn Transport>,
    credential: Credential,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut reporter = SessionReporter {
        epoch,
        events,
        reported: false,
    };

    let mut session = match transport.open(&credential).await {
        Ok(session) => session,
        Err(error) => {
            log::warn!("[Connection] Open failed: {}", error);
            reporter.lost(error);
            return;
        }
    };

    if !reporter.send(SessionEvent::Opened { epoch }) {
        reporter.reported = true;
        return;
    }

    let room = credential.room();
    match session.join(&room).await {
        Ok(()) => log::info!("[Connection] Joined {}", room),
        Err(e) => log::error!("[Connection] Failed to join {}: {}", room, e),
    }

    loop {
        match session.next_frame().await {
            Some(Ok(frame)) => {
                if !reporter.send(SessionEvent::Frame { epoch, frame }) {
                    reporter.reported = true;
                    return;
                }
            }
            Some(Err(error)) => {
                log::warn!("[Connection] Session error: {}", error);
                reporter.lost(error);
                return;
            }
            None => {
                log::info!("[Connection] Session closed by source");
                reporter.lost(ConnectionError::Transport("connection closed".into()));
                return;
            }
        }
    }
}
