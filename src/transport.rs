//! Transport abstraction for the status channel.
//!
//! The status channel is a server push stream: the watcher only ever reads
//! JSON text frames from it. [`Transport`] models one live channel, and
//! [`Connector`] opens a fresh one for a [`ConnectionInfo`] each time the
//! connection manager (re)connects.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use queue_watcher::error::QueueWatcherError;
//! use queue_watcher::transport::{Connector, Transport};
//! use queue_watcher::ConnectionInfo;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn recv(&mut self) -> Option<Result<String, QueueWatcherError>> {
//!         // Receive the next JSON text frame.
//!         // Return None when the connection is closed by the server.
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), QueueWatcherError> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(
//!         &self,
//!         info: &ConnectionInfo,
//!     ) -> Result<Box<dyn Transport>, QueueWatcherError> {
//!         Ok(Box::new(MyTransport {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::config::ConnectionInfo;
use crate::error::QueueWatcherError;

/// One live status channel to the control server.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred (e.g., [`QueueWatcherError::TransportReceive`])
    /// - `None`: the connection was closed by the server
    ///
    /// After [`close`](Transport::close), returns
    /// `Some(Err(QueueWatcherError::TransportClosed))`.
    async fn recv(&mut self) -> Option<Result<String, QueueWatcherError>>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources even then.
    async fn close(&mut self) -> Result<(), QueueWatcherError>;
}

/// Opens status channels.
///
/// Called once per connection attempt; a handshake failure is reported as
/// `Err` and drives the connection manager into `Reconnecting`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new status channel for `info`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::Connect`] or [`QueueWatcherError::Timeout`]
    /// if the handshake does not complete.
    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn Transport>, QueueWatcherError>;
}
