//! Error types for the queue watcher.

use thiserror::Error;

/// Errors that can occur when using the queue watcher.
///
/// Only [`InvalidConnectionInfo`](QueueWatcherError::InvalidConnectionInfo) and
/// [`NotStarted`](QueueWatcherError::NotStarted) ever reach callers of the
/// public control surface. The remaining variants describe failures inside the
/// background loops, which log them and degrade to a status update instead.
#[derive(Debug, Error)]
pub enum QueueWatcherError {
    /// The connection descriptor was rejected before any connection attempt.
    #[error("invalid connection info: {0}")]
    InvalidConnectionInfo(String),

    /// A command name did not match any known queue command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// An inbound status frame was not valid JSON or lacked a `payload`.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The status channel handshake failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// Failed to receive a frame from the status channel.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// `recv` was called on a status channel this side already closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// A command request failed at the HTTP layer or was rejected by the server.
    #[error("command request failed: {0}")]
    Command(#[from] reqwest::Error),

    /// A command was issued before [`QueueWatcher::start`](crate::QueueWatcher::start).
    #[error("watcher has no active session")]
    NotStarted,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// A specialized [`Result`] type for queue watcher operations.
pub type Result<T> = std::result::Result<T, QueueWatcherError>;
