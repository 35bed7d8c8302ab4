//! Connection manager for the status channel.
//!
//! [`ConnectionManager`] owns the single live status channel of a watch
//! session. [`connect`](ConnectionManager::connect) spawns a background loop
//! that walks this state machine:
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──handshake ok──▶ Connected
//!        ▲                        │  ▲                        │
//!        │ close() / give up      │  │ backoff elapsed        │ transport failure
//!        │                        ▼  │                        ▼
//!        └─────────────────── Reconnecting ◀──────────────────┘
//! ```
//!
//! Every frame is decoded before it reaches
//! [`ConnectionHandler::on_message`]; frames that fail to decode are dropped.
//! Failures are never returned to the caller: they surface only as
//! [`ConnectionState::Reconnecting`].
//!
//! Cancellation is a `watch` flag the loop checks, with priority, at each
//! suspension point (handshake, frame receive, backoff sleep).
//! [`close`](ConnectionManager::close) raises the flag and then waits for the
//! loop task to finish, so no callback can fire once it has returned.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{ConnectionInfo, WatcherConfig};
use crate::protocol::{self, StatusMessage};
use crate::transport::{Connector, Transport};

// ── State ───────────────────────────────────────────────────────────

/// Lifecycle state of the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    /// Lowercase name used in status lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free cell holding the current [`ConnectionState`].
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    fn replace(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

// ── Callbacks ───────────────────────────────────────────────────────

/// Receives what the connection manager observes.
///
/// Both methods run on the background loop task, in the order events occur.
/// They must not block and must not call back into the
/// [`ConnectionManager`] that invoked them.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A frame was received and decoded.
    fn on_message(&self, message: StatusMessage);

    /// The connection moved to a new state. Never called twice in a row with
    /// the same state.
    fn on_state_change(&self, state: ConnectionState);
}

// ── Manager ─────────────────────────────────────────────────────────

/// Handle of a running connection loop.
struct Session {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the status channel of one watch session at a time.
///
/// # Example
///
/// ```rust,ignore
/// let mut manager = ConnectionManager::new(connector, &WatcherConfig::default());
/// manager.connect(info, handler).await;
/// // … frames flow to `handler` …
/// manager.close().await;
/// assert_eq!(manager.state(), ConnectionState::Disconnected);
/// ```
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    shutdown_timeout: Duration,
    state: Arc<StateCell>,
    session: Option<Session>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &WatcherConfig) -> Self {
        Self {
            connector,
            backoff: config.backoff.clone(),
            shutdown_timeout: config.shutdown_timeout,
            state: Arc::new(StateCell::default()),
            session: None,
        }
    }

    /// Start maintaining a status channel to `info`.
    ///
    /// Any session already running is closed first, so at most one channel is
    /// ever live. Returns once the loop is spawned; the handshake happens in
    /// the background. `handler` sees `Connecting` before this returns.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn connect(&mut self, info: ConnectionInfo, handler: Arc<dyn ConnectionHandler>) {
        if self.session.is_some() {
            debug!("replacing the running status session");
            self.close().await;
        }

        transition(&self.state, handler.as_ref(), ConnectionState::Connecting);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(
            Arc::clone(&self.connector),
            info,
            handler,
            Arc::clone(&self.state),
            Backoff::new(self.backoff.clone()),
            self.shutdown_timeout,
            cancel_rx,
        ));
        self.session = Some(Session { cancel_tx, task });
    }

    /// Stop the session and release the channel.
    ///
    /// Waits up to the configured shutdown timeout for the loop to close the
    /// channel, then aborts it. After this returns, the handler receives no
    /// further callbacks and the state is `Disconnected`. Calling it without a
    /// running session only resets the state.
    pub async fn close(&mut self) {
        if let Some(Session { cancel_tx, mut task }) = self.session.take() {
            debug!("closing status session");
            let _ = cancel_tx.send(true);

            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection loop aborted: {join_err}");
                    }
                }
            }
        }
        self.state.replace(ConnectionState::Disconnected);
    }

    /// Current state of the status channel.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether a session is running (it may be between reconnect attempts).
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // No executor to drive a graceful close here.
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

// ── Background loop ─────────────────────────────────────────────────

/// Why a connected session ended.
enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// Store `next` and notify the handler if it differs from the current state.
fn transition(cell: &StateCell, handler: &dyn ConnectionHandler, next: ConnectionState) {
    let previous = cell.replace(next);
    if previous != next {
        debug!(from = %previous, to = %next, "connection state changed");
        handler.on_state_change(next);
    }
}

/// Resolves once cancellation is requested or the manager is gone.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn connection_loop(
    connector: Arc<dyn Connector>,
    info: ConnectionInfo,
    handler: Arc<dyn ConnectionHandler>,
    state: Arc<StateCell>,
    mut backoff: Backoff,
    close_timeout: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) {
    debug!(host = %info.host(), port = info.port(), "connection loop started");

    loop {
        let attempt = tokio::select! {
            biased;
            () = cancelled(&mut cancel_rx) => break,
            result = connector.connect(&info) => result,
        };

        match attempt {
            Ok(transport) => {
                transition(&state, handler.as_ref(), ConnectionState::Connected);
                backoff.reset();

                let end =
                    receive_loop(transport, handler.as_ref(), close_timeout, &mut cancel_rx).await;
                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => warn!(%reason, "status channel lost"),
                }
            }
            Err(e) => warn!(error = %e, "status channel handshake failed"),
        }

        transition(&state, handler.as_ref(), ConnectionState::Reconnecting);

        let Some(delay) = backoff.next_delay() else {
            warn!(
                attempts = backoff.attempt(),
                "giving up on the status channel"
            );
            transition(&state, handler.as_ref(), ConnectionState::Disconnected);
            break;
        };
        debug!(attempt = backoff.attempt(), ?delay, "reconnect scheduled");

        tokio::select! {
            biased;
            () = cancelled(&mut cancel_rx) => break,
            () = tokio::time::sleep(delay) => {}
        }

        transition(&state, handler.as_ref(), ConnectionState::Connecting);
    }

    debug!("connection loop exited");
}

/// Pump frames from one live channel until it fails or the session is cancelled.
///
/// The channel is closed before returning in every case.
async fn receive_loop(
    mut transport: Box<dyn Transport>,
    handler: &dyn ConnectionHandler,
    close_timeout: Duration,
    cancel_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let end = loop {
        tokio::select! {
            biased;
            () = cancelled(cancel_rx) => break SessionEnd::Cancelled,
            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => match protocol::decode(&text) {
                    Ok(message) => handler.on_message(message),
                    Err(e) => debug!(error = %e, "dropping undecodable status frame"),
                },
                Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                None => break SessionEnd::Lost("closed by server".into()),
            },
        }
    };

    match tokio::time::timeout(close_timeout, transport.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "status channel close failed"),
        Err(_) => debug!("status channel close timed out"),
    }
    if matches!(end, SessionEnd::Cancelled) {
        info!("status channel closed");
    }
    end
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_cell() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
        ] {
            cell.replace(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    struct Counting(std::sync::Mutex<Vec<ConnectionState>>);

    impl ConnectionHandler for Counting {
        fn on_message(&self, _message: StatusMessage) {}
        fn on_state_change(&self, state: ConnectionState) {
            self.0.lock().unwrap().push(state);
        }
    }

    #[test]
    fn transition_skips_repeated_states() {
        let cell = StateCell::default();
        let handler = Counting(std::sync::Mutex::new(Vec::new()));
        transition(&cell, &handler, ConnectionState::Connecting);
        transition(&cell, &handler, ConnectionState::Connecting);
        transition(&cell, &handler, ConnectionState::Connected);
        assert_eq!(
            *handler.0.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }
}
