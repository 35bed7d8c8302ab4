//! Connection descriptor and watcher tuning.

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{QueueWatcherError, Result};
use crate::protocol::{DEFAULT_PORT, STATUS_PATH, TOKEN_QUERY_PARAM};

/// Default timeout for the status channel handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single command request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the graceful shutdown of the receive loop.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── ConnectionInfo ──────────────────────────────────────────────────

/// Where the control server lives and how to authenticate against it.
///
/// Validated on construction and immutable afterwards. The token is redacted
/// from the `Debug` output.
///
/// # Example
///
/// ```
/// use queue_watcher::ConnectionInfo;
///
/// let info = ConnectionInfo::new("192.168.1.20", 8765, "s3cret").unwrap();
/// assert_eq!(info.command_url("/start-queue"), "http://192.168.1.20:8765/start-queue");
/// assert_eq!(info.status_url().unwrap(), "ws://192.168.1.20:8765/ws?token=s3cret");
///
/// assert!(ConnectionInfo::parse("", "8765", "s3cret").is_err());
/// assert!(ConnectionInfo::parse("192.168.1.20", "http", "s3cret").is_err());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
    token: String,
}

impl ConnectionInfo {
    /// Build a validated descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::InvalidConnectionInfo`] for an empty or
    /// malformed host, port `0`, or an empty token.
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Result<Self> {
        let host = host.into().trim().to_owned();
        let token = token.into();

        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '@'))
        {
            return Err(invalid(format!("host {host:?} contains invalid characters")));
        }
        if port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        if token.is_empty() {
            return Err(invalid("token is empty"));
        }

        let info = Self { host, port, token };
        let probe = Url::parse(&format!("http://{}/", info.authority()))
            .map_err(|e| invalid(format!("host {:?} is not addressable: {e}", info.host)))?;
        if probe.host_str().is_none() {
            return Err(invalid(format!("host {:?} is not addressable", info.host)));
        }
        Ok(info)
    }

    /// Build a descriptor from raw text fields, as typed by a user.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::InvalidConnectionInfo`] if `port` does not
    /// parse as a TCP port, or for anything [`new`](Self::new) rejects.
    pub fn parse(host: &str, port: &str, token: &str) -> Result<Self> {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| invalid(format!("port {port:?} is not a TCP port: {e}")))?;
        Self::new(host, port, token)
    }

    /// Build a descriptor from a pairing payload such as the one encoded in
    /// the control server's QR code: `{"host": "...", "port": 8765, "token": "..."}`.
    ///
    /// `port` may be a number or a numeric string and defaults to
    /// [`DEFAULT_PORT`] when absent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::InvalidConnectionInfo`] if the payload is
    /// not a JSON object or any field is invalid.
    pub fn from_pairing_payload(payload: &str) -> Result<Self> {
        let pairing: PairingPayload = serde_json::from_str(payload)
            .map_err(|e| invalid(format!("pairing payload is not valid: {e}")))?;

        let port = match pairing.port {
            None | Some(serde_json::Value::Null) => DEFAULT_PORT,
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| invalid(format!("port {n} is not a TCP port")))?,
            Some(serde_json::Value::String(s)) => {
                return Self::parse(&pairing.host, &s, &pairing.token);
            }
            Some(other) => return Err(invalid(format!("port {other} is not a TCP port"))),
        };
        Self::new(pairing.host, port, pairing.token)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// URL of the status channel, token included as a query parameter.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::InvalidConnectionInfo`] if the URL cannot
    /// be assembled.
    pub fn status_url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("ws://{}{STATUS_PATH}", self.authority()))
            .map_err(|e| invalid(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(TOKEN_QUERY_PARAM, &self.token);
        Ok(url.into())
    }

    /// URL of a command route on the command channel.
    pub fn command_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.authority())
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct PairingPayload {
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: Option<serde_json::Value>,
    #[serde(default)]
    token: String,
}

fn invalid(reason: impl Into<String>) -> QueueWatcherError {
    QueueWatcherError::InvalidConnectionInfo(reason.into())
}

// ── WatcherConfig ───────────────────────────────────────────────────

/// Tuning for a [`QueueWatcher`](crate::QueueWatcher).
///
/// # Example
///
/// ```
/// use queue_watcher::{BackoffPolicy, WatcherConfig};
/// use std::time::Duration;
///
/// let config = WatcherConfig::default()
///     .with_connect_timeout(Duration::from_secs(3))
///     .with_backoff(BackoffPolicy::default().with_max_attempts(5));
/// assert_eq!(config.backoff.max_attempts, Some(5));
/// ```
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Timeout for the status channel handshake. Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Timeout for a single command request. Defaults to **5 seconds**.
    pub request_timeout: Duration,
    /// How long `close()` waits for the receive loop to close the channel
    /// before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Reconnect policy.
    pub backoff: BackoffPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WatcherConfig {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// A zero timeout aborts the receive loop without a graceful close.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
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

    #[test]
    fn rejects_empty_host() {
        let err = ConnectionInfo::new("  ", 8765, "t").unwrap_err();
        assert!(matches!(err, QueueWatcherError::InvalidConnectionInfo(_)));
    }

    #[test]
    fn rejects_port_zero_and_garbage_ports() {
        assert!(ConnectionInfo::new("10.0.0.2", 0, "t").is_err());
        assert!(ConnectionInfo::parse("10.0.0.2", "", "t").is_err());
        assert!(ConnectionInfo::parse("10.0.0.2", "70000", "t").is_err());
        assert!(ConnectionInfo::parse("10.0.0.2", "-1", "t").is_err());
    }

    #[test]
    fn rejects_empty_token() {
        assert!(ConnectionInfo::new("10.0.0.2", 8765, "").is_err());
    }

    #[test]
    fn rejects_hosts_with_url_syntax() {
        assert!(ConnectionInfo::new("10.0.0.2/ws", 8765, "t").is_err());
        assert!(ConnectionInfo::new("user@10.0.0.2", 8765, "t").is_err());
        assert!(ConnectionInfo::new("my host", 8765, "t").is_err());
    }

    #[test]
    fn parse_trims_port() {
        let info = ConnectionInfo::parse("10.0.0.2", " 9000 ", "t").unwrap();
        assert_eq!(info.port(), 9000);
    }

    #[test]
    fn status_url_encodes_token() {
        let info = ConnectionInfo::new("10.0.0.2", 8765, "a b&c").unwrap();
        assert_eq!(
            info.status_url().unwrap(),
            "ws://10.0.0.2:8765/ws?token=a+b%26c"
        );
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let info = ConnectionInfo::new("::1", 8765, "t").unwrap();
        assert_eq!(info.authority(), "[::1]:8765");
        assert_eq!(info.command_url("/stop-queue"), "http://[::1]:8765/stop-queue");
    }

    #[test]
    fn debug_redacts_token() {
        let info = ConnectionInfo::new("10.0.0.2", 8765, "hunter2").unwrap();
        let debug = format!("{info:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("10.0.0.2"));
    }

    #[test]
    fn pairing_payload_with_numeric_port() {
        let info = ConnectionInfo::from_pairing_payload(
            r#"{"host":"192.168.1.5","port":9001,"token":"abc"}"#,
        )
        .unwrap();
        assert_eq!(info.host(), "192.168.1.5");
        assert_eq!(info.port(), 9001);
        assert_eq!(info.token(), "abc");
    }

    #[test]
    fn pairing_payload_with_string_port() {
        let info =
            ConnectionInfo::from_pairing_payload(r#"{"host":"h","port":"9002","token":"abc"}"#)
                .unwrap();
        assert_eq!(info.port(), 9002);
    }

    #[test]
    fn pairing_payload_defaults_port() {
        let info = ConnectionInfo::from_pairing_payload(r#"{"host":"h","token":"abc"}"#).unwrap();
        assert_eq!(info.port(), DEFAULT_PORT);
    }

    #[test]
    fn pairing_payload_rejects_garbage() {
        assert!(ConnectionInfo::from_pairing_payload("not json").is_err());
        assert!(ConnectionInfo::from_pairing_payload(r#"{"port":8765,"token":"abc"}"#).is_err());
        assert!(
            ConnectionInfo::from_pairing_payload(r#"{"host":"h","port":true,"token":"abc"}"#)
                .is_err()
        );
        assert!(
            ConnectionInfo::from_pairing_payload(r#"{"host":"h","port":65536,"token":"abc"}"#)
                .is_err()
        );
    }

    #[test]
    fn config_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(config.backoff.max_attempts, None);
    }
}
