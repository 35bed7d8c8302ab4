//! Queue watcher: the control surface handed to the UI layer.
//!
//! [`QueueWatcher`] drives a [`ConnectionManager`] for the status channel and
//! a [`CommandRelay`] for the command channel. It turns decoded `state`
//! frames into [`WatcherEvent`]s published on an unbounded channel returned
//! from the constructor:
//!
//! - a [`WatcherEvent::Status`] line for every state frame and every
//!   connection state change;
//! - an [`Alert`] when the queue *enters* `match_found` or `accepted`
//!   (repeated frames with the same state do not re-alert);
//! - [`WatcherEvent::AutoAcceptReported`] when the server reports a new value
//!   of its auto-accept flag, in any frame kind.
//!
//! `auto_accept` and `timeout` frames emit no status line or alert, but the
//! queue state they carry is remembered, so a `timeout` back to `idle`
//! re-arms the `match_found` alert.
//!
//! Commands never wait on the network: [`set_auto_accept`](QueueWatcher::set_auto_accept)
//! and [`issue`](QueueWatcher::issue) queue a request and return.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), queue_watcher::QueueWatcherError> {
//! use queue_watcher::{Alert, ConnectionInfo, QueueWatcher, WatcherConfig, WatcherEvent};
//!
//! let (watcher, mut events) = QueueWatcher::new(WatcherConfig::default())?;
//! watcher.start(ConnectionInfo::new("192.168.1.20", 8765, "s3cret")?).await;
//! watcher.set_auto_accept(true)?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         WatcherEvent::Status(line) => println!("{line}"),
//!         WatcherEvent::Alert(Alert::MatchFound) => println!("match found!"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{ConnectionInfo, WatcherConfig};
use crate::connection::{ConnectionHandler, ConnectionManager, ConnectionState, StateCell};
use crate::error::{QueueWatcherError, Result};
use crate::event::{Alert, WatcherEvent};
use crate::protocol::{Command, MessageKind, QueueCommand, QueueState, StatusMessage};
use crate::relay::{CommandRelay, CommandTransport};
use crate::transport::Connector;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Dispatcher ──────────────────────────────────────────────────────

/// What the dispatcher remembers between frames of one session.
#[derive(Debug, Default)]
struct Tracked {
    queue_state: Option<QueueState>,
    auto_accept: Option<bool>,
}

/// Maps connection callbacks onto [`WatcherEvent`]s.
struct Dispatcher {
    events: mpsc::UnboundedSender<WatcherEvent>,
    tracked: Mutex<Tracked>,
}

impl Dispatcher {
    fn emit(&self, event: WatcherEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn reset(&self) {
        *lock(&self.tracked) = Tracked::default();
    }
}

impl ConnectionHandler for Dispatcher {
    fn on_message(&self, message: StatusMessage) {
        // `auto_accept` and `timeout` frames carry a full snapshot too; they
        // update what is tracked but never produce status lines or alerts.
        let drives_status = match &message.kind {
            MessageKind::State => true,
            MessageKind::AutoAccept | MessageKind::Timeout => false,
            MessageKind::Other(kind) => {
                debug!(%kind, "ignoring status frame");
                return;
            }
        };
        let payload = message.payload;
        let queue_state = payload.queue_state;

        let (alert, auto_accept) = {
            let mut tracked = lock(&self.tracked);
            let alert = if drives_status {
                let entered = tracked.queue_state.as_ref() != Some(&queue_state);
                match queue_state {
                    QueueState::MatchFound if entered => Some(Alert::MatchFound),
                    QueueState::Accepted if entered => Some(Alert::MatchAccepted),
                    _ => None,
                }
            } else {
                None
            };
            if drives_status || queue_state != QueueState::Unknown {
                tracked.queue_state = Some(queue_state.clone());
            }

            let auto_accept = payload
                .auto_accept_enabled
                .filter(|enabled| tracked.auto_accept != Some(*enabled));
            if auto_accept.is_some() {
                tracked.auto_accept = auto_accept;
            }
            (alert, auto_accept)
        };

        if drives_status {
            self.emit(WatcherEvent::Status(format!("Queue: {queue_state}")));
        }
        if let Some(alert) = alert {
            info!(?alert, "queue alert");
            self.emit(WatcherEvent::Alert(alert));
        }
        if let Some(enabled) = auto_accept {
            self.emit(WatcherEvent::AutoAcceptReported(enabled));
        }
    }

    fn on_state_change(&self, state: ConnectionState) {
        self.emit(WatcherEvent::ConnectionChanged(state));
        self.emit(WatcherEvent::Status(format!("Connection: {state}")));
    }
}

// ── QueueWatcher ────────────────────────────────────────────────────

/// Watches a control server's queue and relays user commands to it.
///
/// All methods take `&self`, so the watcher can be shared behind an `Arc`
/// between the UI and the host lifecycle hooks.
pub struct QueueWatcher {
    manager: tokio::sync::Mutex<ConnectionManager>,
    connection_state: Arc<StateCell>,
    relay: CommandRelay,
    session: Mutex<Option<ConnectionInfo>>,
    dispatcher: Arc<Dispatcher>,
}

impl QueueWatcher {
    /// Create a watcher that uses a WebSocket status channel and HTTP commands.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::Command`] if the HTTP client cannot be
    /// initialized.
    #[cfg(feature = "transport-websocket")]
    pub fn new(config: WatcherConfig) -> Result<(Self, mpsc::UnboundedReceiver<WatcherEvent>)> {
        let connector = Arc::new(crate::transports::WebSocketConnector::new(
            config.connect_timeout,
        ));
        let commands = Arc::new(crate::relay::HttpCommandTransport::new(
            config.request_timeout,
        )?);
        Ok(Self::with_parts(connector, commands, config))
    }

    /// Create a watcher from explicit channel implementations.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn with_parts(
        connector: Arc<dyn Connector>,
        commands: Arc<dyn CommandTransport>,
        config: WatcherConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WatcherEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(connector, &config);
        let connection_state = manager.state_cell();

        let watcher = Self {
            manager: tokio::sync::Mutex::new(manager),
            connection_state,
            relay: CommandRelay::start(commands),
            session: Mutex::new(None),
            dispatcher: Arc::new(Dispatcher {
                events: events_tx,
                tracked: Mutex::new(Tracked::default()),
            }),
        };
        (watcher, events_rx)
    }

    /// Begin watching the control server described by `info`.
    ///
    /// Replaces any session already running. Returns once the connection loop
    /// is running; the handshake and any reconnects happen in the background.
    ///
    /// Replacing a live session waits for it to shut down, which can take up
    /// to [`WatcherConfig::shutdown_timeout`].
    pub async fn start(&self, info: ConnectionInfo) {
        let mut manager = self.manager.lock().await;
        manager.close().await;
        self.dispatcher.reset();

        info!(host = %info.host(), port = info.port(), "watch session starting");
        *lock(&self.session) = Some(info.clone());

        let handler: Arc<dyn ConnectionHandler> = self.dispatcher.clone();
        manager.connect(info, handler).await;
    }

    /// Stop watching and forget the connection info.
    ///
    /// Emits a final `Disconnected` update if a session was connected or
    /// reconnecting; nothing is emitted after that. May wait up to
    /// [`WatcherConfig::shutdown_timeout`] for the session to shut down.
    pub async fn stop(&self) {
        let mut manager = self.manager.lock().await;
        let previous = manager.state();
        manager.close().await;
        *lock(&self.session) = None;

        if previous != ConnectionState::Disconnected {
            info!("watch session stopped");
            self.dispatcher.on_state_change(ConnectionState::Disconnected);
        }
    }

    /// Ask the server to enable or disable auto-accept.
    ///
    /// Request-only: nothing changes locally until the server reports the new
    /// value through a status frame.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::NotStarted`] without a running session.
    pub fn set_auto_accept(&self, enabled: bool) -> Result<()> {
        self.relay
            .send(&self.current_info()?, Command::ToggleAutoAccept { enabled });
        Ok(())
    }

    /// Ask the server to start or stop queueing.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::NotStarted`] without a running session.
    pub fn issue(&self, command: QueueCommand) -> Result<()> {
        self.relay.send(&self.current_info()?, command.into());
        Ok(())
    }

    /// Last queue state reported in this session.
    pub fn queue_state(&self) -> Option<QueueState> {
        lock(&self.dispatcher.tracked).queue_state.clone()
    }

    /// Last auto-accept flag reported in this session.
    pub fn auto_accept(&self) -> Option<bool> {
        lock(&self.dispatcher.tracked).auto_accept
    }

    /// Current state of the status channel.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.get()
    }

    /// Connection info of the running session.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        lock(&self.session).clone()
    }

    /// Number of command requests that failed so far.
    pub fn command_failures(&self) -> u64 {
        self.relay.failures()
    }

    fn current_info(&self) -> Result<ConnectionInfo> {
        lock(&self.session)
            .clone()
            .ok_or(QueueWatcherError::NotStarted)
    }
}

impl std::fmt::Debug for QueueWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWatcher")
            .field("connection_state", &self.connection_state())
            .field("queue_state", &self.queue_state())
            .field("session", &self.connection_info())
            .finish()
    }
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

    fn dispatcher() -> (Dispatcher, mpsc::UnboundedReceiver<WatcherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Dispatcher {
                events: tx,
                tracked: Mutex::new(Tracked::default()),
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WatcherEvent>) -> Vec<WatcherEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn alerts(events: &[WatcherEvent]) -> Vec<Alert> {
        events
            .iter()
            .filter_map(|e| match e {
                WatcherEvent::Alert(alert) => Some(*alert),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn match_found_alerts_are_edge_triggered() {
        let (dispatcher, mut rx) = dispatcher();
        for state in ["queued", "match_found", "match_found", "queued", "match_found"] {
            dispatcher.on_message(StatusMessage::state(state));
        }
        let events = drain(&mut rx);
        assert_eq!(alerts(&events), vec![Alert::MatchFound, Alert::MatchFound]);
    }

    #[test]
    fn accepted_alert_fires_once_per_entry() {
        let (dispatcher, mut rx) = dispatcher();
        for state in ["match_found", "accepted", "accepted", "idle"] {
            dispatcher.on_message(StatusMessage::state(state));
        }
        let events = drain(&mut rx);
        assert_eq!(
            alerts(&events),
            vec![Alert::MatchFound, Alert::MatchAccepted]
        );
    }

    #[test]
    fn status_line_is_always_emitted() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(StatusMessage::state("match_found"));
        dispatcher.on_message(StatusMessage::state("match_found"));
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                WatcherEvent::Status("Queue: match_found".into()),
                WatcherEvent::Alert(Alert::MatchFound),
                WatcherEvent::Status("Queue: match_found".into()),
            ]
        );
    }

    fn frame(kind: MessageKind, state: &str, auto_accept: Option<bool>) -> StatusMessage {
        let mut msg = StatusMessage::state(state);
        msg.kind = kind;
        msg.payload.auto_accept_enabled = auto_accept;
        msg
    }

    #[test]
    fn unknown_frame_types_are_ignored() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(frame(
            MessageKind::Other("heartbeat".into()),
            "match_found",
            Some(true),
        ));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(lock(&dispatcher.tracked).queue_state, None);
        assert_eq!(lock(&dispatcher.tracked).auto_accept, None);
    }

    #[test]
    fn timeout_frame_updates_state_silently() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(frame(MessageKind::Timeout, "idle", Some(false)));
        assert_eq!(drain(&mut rx), vec![WatcherEvent::AutoAcceptReported(false)]);
        assert_eq!(lock(&dispatcher.tracked).queue_state, Some(QueueState::Idle));
    }

    #[test]
    fn timeout_back_to_idle_rearms_match_found_alert() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(StatusMessage::state("match_found"));
        dispatcher.on_message(frame(MessageKind::Timeout, "idle", Some(false)));
        dispatcher.on_message(StatusMessage::state("match_found"));
        assert_eq!(
            alerts(&drain(&mut rx)),
            vec![Alert::MatchFound, Alert::MatchFound]
        );
    }

    #[test]
    fn auto_accept_frame_reports_server_toggle() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(frame(MessageKind::State, "searching", Some(true)));
        drain(&mut rx);

        dispatcher.on_message(frame(MessageKind::AutoAccept, "searching", Some(false)));
        assert_eq!(drain(&mut rx), vec![WatcherEvent::AutoAcceptReported(false)]);
        assert_eq!(lock(&dispatcher.tracked).auto_accept, Some(false));
    }

    #[test]
    fn snapshot_without_queue_state_keeps_tracked_state() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(StatusMessage::state("match_found"));
        dispatcher.on_message(frame(MessageKind::AutoAccept, "unknown", Some(true)));
        dispatcher.on_message(StatusMessage::state("match_found"));
        assert_eq!(alerts(&drain(&mut rx)), vec![Alert::MatchFound]);
    }

    #[test]
    fn auto_accept_reported_on_change_only() {
        let (dispatcher, mut rx) = dispatcher();
        let mut msg = StatusMessage::state("idle");
        msg.payload.auto_accept_enabled = Some(true);
        dispatcher.on_message(msg.clone());
        dispatcher.on_message(msg.clone());
        msg.payload.auto_accept_enabled = Some(false);
        dispatcher.on_message(msg);

        let reported: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WatcherEvent::AutoAcceptReported(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(reported, vec![true, false]);
    }

    #[test]
    fn reset_forgets_previous_state() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_message(StatusMessage::state("match_found"));
        dispatcher.reset();
        dispatcher.on_message(StatusMessage::state("match_found"));
        assert_eq!(
            alerts(&drain(&mut rx)),
            vec![Alert::MatchFound, Alert::MatchFound]
        );
    }

    #[test]
    fn connection_changes_produce_status_lines() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.on_state_change(ConnectionState::Reconnecting);
        assert_eq!(
            drain(&mut rx),
            vec![
                WatcherEvent::ConnectionChanged(ConnectionState::Reconnecting),
                WatcherEvent::Status("Connection: reconnecting".into()),
            ]
        );
    }
}
