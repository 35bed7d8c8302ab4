//! Events a [`QueueWatcher`](crate::QueueWatcher) publishes to its observer.

use crate::connection::ConnectionState;

/// A user-facing alert, fired once per transition into the matching queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alert {
    /// The queue moved into `match_found`.
    MatchFound,
    /// The queue moved into `accepted`.
    MatchAccepted,
}

/// Everything the watcher reports, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// Human-readable status line, e.g. `"Queue: match_found"` or
    /// `"Connection: reconnecting"`.
    Status(String),
    /// An edge-triggered alert.
    Alert(Alert),
    /// The status channel changed state.
    ConnectionChanged(ConnectionState),
    /// The server reported a new value of its auto-accept flag.
    AutoAcceptReported(bool),
}
