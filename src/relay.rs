//! Command relay for the control server's command channel.
//!
//! Commands are best-effort: [`CommandRelay::send`] queues the request and
//! returns immediately. A background worker performs the requests one at a
//! time in the order they were queued. Failures are logged and counted, never
//! retried and never reported to the sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ConnectionInfo;
use crate::error::Result;
use crate::protocol::{Command, AUTH_HEADER, JSON_CONTENT_TYPE};

/// Performs a single authenticated command request.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// `POST` `body` as JSON to `url`, authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be delivered or the server
    /// answers with a non-success status.
    async fn post(&self, url: &str, token: &str, body: Vec<u8>) -> Result<()>;
}

/// [`CommandTransport`] over plain HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpCommandTransport {
    client: reqwest::Client,
}

impl HttpCommandTransport {
    /// Build a client whose requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::Command`](crate::QueueWatcherError::Command)
    /// if the HTTP client cannot be initialized.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CommandTransport for HttpCommandTransport {
    async fn post(&self, url: &str, token: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .post(url)
            .header(AUTH_HEADER, token)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// A queued command, addressed and authenticated.
struct Outgoing {
    url: String,
    token: String,
    path: &'static str,
    body: Vec<u8>,
}

/// Fire-and-forget sender for [`Command`]s.
///
/// The worker task exits once the relay is dropped and the queue is drained.
pub struct CommandRelay {
    tx: mpsc::UnboundedSender<Outgoing>,
    failures: Arc<AtomicU64>,
}

impl CommandRelay {
    /// Spawn the relay worker. Must be called within a Tokio runtime.
    pub fn start(transport: Arc<dyn CommandTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicU64::new(0));
        tokio::spawn(relay_loop(transport, rx, Arc::clone(&failures)));
        Self { tx, failures }
    }

    /// Queue `command` for the control server described by `info`.
    pub fn send(&self, info: &ConnectionInfo, command: Command) {
        let outgoing = Outgoing {
            url: info.command_url(command.path()),
            token: info.token().to_owned(),
            path: command.path(),
            body: command.body(),
        };
        if self.tx.send(outgoing).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(path = command.path(), "command relay stopped, dropping command");
        }
    }

    /// Number of commands that failed since the relay started.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CommandRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRelay")
            .field("failures", &self.failures())
            .finish()
    }
}

async fn relay_loop(
    transport: Arc<dyn CommandTransport>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    failures: Arc<AtomicU64>,
) {
    while let Some(outgoing) = rx.recv().await {
        match transport
            .post(&outgoing.url, &outgoing.token, outgoing.body)
            .await
        {
            Ok(()) => debug!(path = outgoing.path, "command delivered"),
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = outgoing.path, error = %e, "command request failed");
            }
        }
    }
    debug!("command relay exited");
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
    use crate::error::QueueWatcherError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        requests: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl CommandTransport for Recording {
        async fn post(&self, url: &str, token: &str, body: Vec<u8>) -> Result<()> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_owned(), token.to_owned(), body));
            if url.ends_with("/stop-queue") {
                return Err(QueueWatcherError::Timeout);
            }
            Ok(())
        }
    }

    async fn wait_for_requests(recording: &Recording, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while recording.requests.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("requests were not relayed in time");
    }

    #[tokio::test]
    async fn relays_commands_in_order() {
        let recording = Arc::new(Recording::default());
        let relay = CommandRelay::start(recording.clone());
        let info = ConnectionInfo::new("10.0.0.7", 8765, "tkn").unwrap();

        relay.send(&info, Command::ToggleAutoAccept { enabled: true });
        relay.send(&info, Command::StartQueue);
        wait_for_requests(&recording, 2).await;

        let requests = recording.requests.lock().unwrap();
        assert_eq!(requests[0].0, "http://10.0.0.7:8765/toggle-auto-accept");
        assert_eq!(requests[0].1, "tkn");
        assert_eq!(requests[0].2, br#"{"enabled":true}"#.to_vec());
        assert_eq!(requests[1].0, "http://10.0.0.7:8765/start-queue");
        assert_eq!(requests[1].2, b"{}".to_vec());
        assert_eq!(relay.failures(), 0);
    }

    #[tokio::test]
    async fn failures_are_counted_not_retried() {
        let recording = Arc::new(Recording::default());
        let relay = CommandRelay::start(recording.clone());
        let info = ConnectionInfo::new("10.0.0.7", 8765, "tkn").unwrap();

        relay.send(&info, Command::StopQueue);
        relay.send(&info, Command::StartQueue);
        wait_for_requests(&recording, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(recording.requests.lock().unwrap().len(), 2);
        assert_eq!(relay.failures(), 1);
    }
}
