//! # Queue Watcher
//!
//! Resilient client for a LAN matchmaking-queue control server.
//!
//! The control server exposes a status push channel (WebSocket, JSON frames)
//! and a command channel (authenticated HTTP `POST`s). This crate keeps the
//! status channel alive across network failures, turns queue state changes
//! into edge-triggered alerts and human-readable status lines, and relays
//! start/stop/auto-accept commands back to the server.
//!
//! ## Features
//!
//! - **Unattended**: reconnects with bounded, jittered exponential backoff and
//!   never surfaces transport failures as errors
//! - **Cancellable**: `stop()` takes effect even mid-backoff, and no event is
//!   emitted after it returns
//! - **Lenient decoding**: unknown frame types and queue states pass through
//! - **Pluggable channels**: implement [`Connector`]/[`Transport`] or
//!   [`CommandTransport`] to swap the WebSocket or HTTP layer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), queue_watcher::QueueWatcherError> {
//! use queue_watcher::{ConnectionInfo, QueueCommand, QueueWatcher, WatcherConfig};
//!
//! let info = ConnectionInfo::from_pairing_payload(
//!     r#"{"host":"192.168.1.20","port":8765,"token":"s3cret"}"#,
//! )?;
//! let (watcher, mut events) = QueueWatcher::new(WatcherConfig::default())?;
//! watcher.start(info).await;
//! watcher.issue(QueueCommand::StartQueue)?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod transports;
pub mod watcher;

// Re-export primary types for ergonomic imports.
pub use backoff::BackoffPolicy;
pub use config::{ConnectionInfo, WatcherConfig};
pub use connection::{ConnectionHandler, ConnectionManager, ConnectionState};
pub use error::QueueWatcherError;
pub use event::{Alert, WatcherEvent};
pub use protocol::{Command, QueueCommand, QueueState, StatusMessage};
pub use relay::{CommandRelay, CommandTransport, HttpCommandTransport};
pub use transport::{Connector, Transport};
pub use watcher::QueueWatcher;

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
