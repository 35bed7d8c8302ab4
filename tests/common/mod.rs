#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for queue watcher integration tests.
//!
//! Provides a channel-backed [`MockTransport`] handed out by a scripted
//! [`MockConnector`], a [`RecordingHandler`] for connection callbacks, a
//! [`RecordingCommands`] command transport, and JSON helpers.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use queue_watcher::{
    BackoffPolicy, CommandTransport, ConnectionHandler, ConnectionInfo, ConnectionState,
    Connector, QueueWatcherError, StatusMessage, Transport, WatcherConfig,
};

/// How long helpers wait for something that is expected to happen.
pub const EXPECT_WITHIN: Duration = Duration::from_secs(2);

/// One scripted item for `Transport::recv`.
pub type Frame = Option<Result<String, QueueWatcherError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// Status channel whose frames are pushed by the test through a [`ServerSide`].
pub struct MockTransport {
    frames: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn recv(&mut self) -> Option<Result<String, QueueWatcherError>> {
        if self.closed.load(Ordering::Acquire) {
            return Some(Err(QueueWatcherError::TransportClosed));
        }
        match self.frames.recv().await {
            Some(frame) => frame,
            // The test dropped its ServerSide; behave like an idle server.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), QueueWatcherError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The test's end of one [`MockTransport`].
#[derive(Debug)]
pub struct ServerSide {
    frames: mpsc::UnboundedSender<Frame>,
    pub closed: Arc<AtomicBool>,
}

impl ServerSide {
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.frames.send(Some(Ok(text.into())));
    }

    pub fn push_state(&self, queue_state: &str) {
        self.push_raw(state_json(queue_state));
    }

    /// Report a transport error on the channel.
    pub fn fail(&self) {
        let _ = self
            .frames
            .send(Some(Err(QueueWatcherError::TransportReceive(
                "connection reset".into(),
            ))));
    }

    /// Close the channel from the server side.
    pub fn hang_up(&self) {
        let _ = self.frames.send(None);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Connector that succeeds or fails per a script, then per `fallback`.
///
/// Every successful attempt publishes its [`ServerSide`] on the receiver
/// returned from [`MockConnector::new`].
pub struct MockConnector {
    script: StdMutex<VecDeque<bool>>,
    fallback: bool,
    attempts: AtomicUsize,
    live: Arc<AtomicUsize>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    pub fn new(
        script: Vec<bool>,
        fallback: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, servers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: StdMutex::new(VecDeque::from(script)),
            fallback,
            attempts: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            servers,
        });
        (connector, servers_rx)
    }

    pub fn always_ok() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::new(Vec::new(), true)
    }

    pub fn always_failing() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::new(Vec::new(), false)
    }

    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Number of transports handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _info: &ConnectionInfo,
    ) -> Result<Box<dyn Transport>, QueueWatcherError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let ok = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if !ok {
            return Err(QueueWatcherError::Connect("connection refused".into()));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.live.fetch_add(1, Ordering::AcqRel);
        let transport = MockTransport {
            frames: frames_rx,
            closed: Arc::clone(&closed),
            live: Arc::clone(&self.live),
        };
        let _ = self.servers.send(ServerSide {
            frames: frames_tx,
            closed,
        });
        Ok(Box::new(transport))
    }
}

// ── RecordingHandler ────────────────────────────────────────────────

/// A connection callback, as observed by [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Message(StatusMessage),
    State(ConnectionState),
}

/// Forwards every callback to a channel the test reads from.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Seen>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_message(&self, message: StatusMessage) {
        let _ = self.tx.send(Seen::Message(message));
    }

    fn on_state_change(&self, state: ConnectionState) {
        let _ = self.tx.send(Seen::State(state));
    }
}

// ── RecordingCommands ───────────────────────────────────────────────

/// One command request as seen by [`RecordingCommands`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub token: String,
    pub body: String,
}

/// Command transport that records requests, optionally failing them all.
#[derive(Default)]
pub struct RecordingCommands {
    pub requests: StdMutex<Vec<RecordedRequest>>,
    pub fail: bool,
}

impl RecordingCommands {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait until at least `count` requests were recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<RecordedRequest> {
        tokio::time::timeout(EXPECT_WITHIN, async {
            loop {
                let requests = self.requests();
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command requests were not relayed in time")
    }
}

#[async_trait]
impl CommandTransport for RecordingCommands {
    async fn post(&self, url: &str, token: &str, body: Vec<u8>) -> Result<(), QueueWatcherError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_owned(),
            token: token.to_owned(),
            body: String::from_utf8(body).unwrap(),
        });
        if self.fail {
            return Err(QueueWatcherError::Timeout);
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// JSON for a `state` frame carrying `queue_state`.
pub fn state_json(queue_state: &str) -> String {
    serde_json::json!({ "type": "state", "payload": { "queue_state": queue_state } }).to_string()
}

/// Connection info pointing nowhere in particular.
pub fn test_info() -> ConnectionInfo {
    ConnectionInfo::new("127.0.0.1", 8765, "test-token").unwrap()
}

/// Config with millisecond backoff and no jitter.
pub fn fast_config() -> WatcherConfig {
    WatcherConfig::default()
        .with_shutdown_timeout(Duration::from_millis(500))
        .with_backoff(
            BackoffPolicy::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(40))
                .with_jitter_ratio(0.0),
        )
}

/// Receive the next item or panic after [`EXPECT_WITHIN`].
pub async fn next<T: Debug>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(EXPECT_WITHIN, rx.recv())
        .await
        .expect("timed out waiting for the next item")
        .expect("channel closed")
}

/// Assert that nothing arrives on `rx` for `quiet_for`.
pub async fn assert_quiet<T: Debug>(rx: &mut mpsc::UnboundedReceiver<T>, quiet_for: Duration) {
    if let Ok(Some(item)) = tokio::time::timeout(quiet_for, rx.recv()).await {
        panic!("expected silence, got {item:?}");
    }
}

/// Take everything already queued on `rx`.
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
