//! Wire protocol of the queue control server.
//!
//! Two plaintext JSON channels connect the watcher to the control server:
//!
//! - the **status channel**, a WebSocket at `/ws?token=…` on which the server
//!   pushes frames shaped `{"type": "...", "payload": {"queue_state": "...", ...}}`;
//! - the **command channel**, one `POST` per command carrying the
//!   [`AUTH_HEADER`] and a small JSON body.
//!
//! [`decode`] turns a raw status frame into a [`StatusMessage`]. It is lenient
//! where the server is allowed to evolve: unknown frame types and unknown
//! queue states pass through as opaque strings, and a payload without
//! `queue_state` decodes as [`QueueState::Unknown`]. Payload fields of the
//! wrong type decode as absent. Only text that is not JSON,
//! or a frame without a `payload` object, is rejected.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{QueueWatcherError, Result};

// ── Wire constants ──────────────────────────────────────────────────

/// Header carrying the shared token on every command request.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Path of the status channel endpoint.
pub const STATUS_PATH: &str = "/ws";

/// Query parameter carrying the token on the status channel handshake.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Port the control server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8765;

/// Content type of every command body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ── Queue state ─────────────────────────────────────────────────────

/// Matchmaking phase as reported by the control server.
///
/// The set is open-ended: values this crate does not know are preserved in
/// [`QueueState::Other`] rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueueState {
    #[default]
    Unknown,
    Disconnected,
    Idle,
    Queued,
    /// The control server's own name for being in queue.
    Searching,
    MatchFound,
    Accepted,
    Other(String),
}

impl QueueState {
    /// The wire representation of this state.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown => "unknown",
            Self::Disconnected => "disconnected",
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Searching => "searching",
            Self::MatchFound => "match_found",
            Self::Accepted => "accepted",
            Self::Other(other) => other,
        }
    }
}

impl From<String> for QueueState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "unknown" => Self::Unknown,
            "disconnected" => Self::Disconnected,
            "idle" => Self::Idle,
            "queued" => Self::Queued,
            "searching" => Self::Searching,
            "match_found" => Self::MatchFound,
            "accepted" => Self::Accepted,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for QueueState {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<QueueState> for String {
    fn from(state: QueueState) -> Self {
        match state {
            QueueState::Other(other) => other,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Frame types ─────────────────────────────────────────────────────

/// Discriminator of a status frame (`type` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Queue state snapshot. The only kind the watcher acts upon.
    State,
    /// Broadcast after the auto-accept flag was toggled.
    AutoAccept,
    /// Broadcast after the server gave up waiting on a found match.
    Timeout,
    Other(String),
}

impl MessageKind {
    /// The wire representation of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::State => "state",
            Self::AutoAccept => "auto_accept",
            Self::Timeout => "timeout",
            Self::Other(other) => other,
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "state" => Self::State,
            "auto_accept" => Self::AutoAccept,
            "timeout" => Self::Timeout,
            _ => Self::Other(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(other) => other,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a status frame.
///
/// Only `queue_state` matters to the watcher; the remaining fields mirror what
/// the control server includes in its snapshots and are kept for observers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Missing, `null` or non-string decodes as [`QueueState::Unknown`].
    #[serde(default, deserialize_with = "queue_state_or_unknown")]
    pub queue_state: QueueState,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_accept_enabled: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_event: Option<String>,
    /// ISO 8601 timestamp of the last state change.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_state_change_at: Option<String>,
    /// ISO 8601 timestamp of the last `match_found`.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_match_found_at: Option<String>,
    /// Any additional metadata keys the server attached.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusPayload {
    /// A payload carrying only a queue state.
    pub fn with_state(queue_state: impl Into<QueueState>) -> Self {
        Self {
            queue_state: queue_state.into(),
            ..Self::default()
        }
    }
}

fn queue_state_or_unknown<'de, D>(deserializer: D) -> std::result::Result<QueueState, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient::<D, QueueState>(deserializer)?.unwrap_or_default())
}

/// A field of the wrong type decodes as `None` instead of failing the frame.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// A decoded frame from the status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// A frame without `type` decodes as an empty [`MessageKind::Other`].
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub payload: StatusPayload,
}

impl StatusMessage {
    /// A `state` frame for the given queue state.
    pub fn state(queue_state: impl Into<QueueState>) -> Self {
        Self {
            kind: MessageKind::State,
            payload: StatusPayload::with_state(queue_state),
        }
    }

    /// Whether this frame is a queue state snapshot.
    pub fn is_state(&self) -> bool {
        self.kind == MessageKind::State
    }
}

// ── Codec ───────────────────────────────────────────────────────────

/// Decode one inbound status frame.
///
/// # Errors
///
/// Returns [`QueueWatcherError::Decode`] if `raw` is not JSON, if it has no
/// `payload` object, or if a present `queue_state` is not a string.
pub fn decode(raw: impl AsRef<[u8]>) -> Result<StatusMessage> {
    Ok(serde_json::from_slice(raw.as_ref())?)
}

/// Body of the auto-accept toggle command: `{"enabled": <bool>}`.
pub fn encode_toggle(enabled: bool) -> Vec<u8> {
    serde_json::json!({ "enabled": enabled })
        .to_string()
        .into_bytes()
}

/// Body of the parameterless commands: `{}`.
pub fn encode_empty() -> Vec<u8> {
    b"{}".to_vec()
}

// ── Commands ────────────────────────────────────────────────────────

/// A request for the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartQueue,
    StopQueue,
    ToggleAutoAccept { enabled: bool },
}

impl Command {
    /// Route of the command on the control server.
    pub fn path(&self) -> &'static str {
        match self {
            Self::StartQueue => "/start-queue",
            Self::StopQueue => "/stop-queue",
            Self::ToggleAutoAccept { .. } => "/toggle-auto-accept",
        }
    }

    /// Serialized JSON body of the command.
    pub fn body(&self) -> Vec<u8> {
        match self {
            Self::StartQueue | Self::StopQueue => encode_empty(),
            Self::ToggleAutoAccept { enabled } => encode_toggle(*enabled),
        }
    }
}

/// Parameterless queue commands a user can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCommand {
    StartQueue,
    StopQueue,
}

impl From<QueueCommand> for Command {
    fn from(command: QueueCommand) -> Self {
        match command {
            QueueCommand::StartQueue => Self::StartQueue,
            QueueCommand::StopQueue => Self::StopQueue,
        }
    }
}

impl FromStr for QueueCommand {
    type Err = QueueWatcherError;

    /// Accepts `start-queue` and `stop-queue`, with or without a leading `/`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('/') {
            "start-queue" => Ok(Self::StartQueue),
            "stop-queue" => Ok(Self::StopQueue),
            other => Err(QueueWatcherError::UnknownCommand(other.to_owned())),
        }
    }
}

impl fmt::Display for QueueCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = Command::from(*self).path();
        f.write_str(path.trim_start_matches('/'))
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
    fn known_queue_states_map_to_variants() {
        assert_eq!(QueueState::from("match_found"), QueueState::MatchFound);
        assert_eq!(QueueState::from("accepted"), QueueState::Accepted);
        assert_eq!(QueueState::from("searching"), QueueState::Searching);
        assert_eq!(QueueState::from("queued"), QueueState::Queued);
    }

    #[test]
    fn unknown_queue_state_is_preserved() {
        let state = QueueState::from("in_lobby");
        assert_eq!(state, QueueState::Other("in_lobby".into()));
        assert_eq!(state.as_str(), "in_lobby");
        assert_eq!(String::from(state), "in_lobby");
    }

    #[test]
    fn decode_state_frame() {
        let msg = decode(r#"{"type":"state","payload":{"queue_state":"idle"}}"#).unwrap();
        assert!(msg.is_state());
        assert_eq!(msg.payload.queue_state, QueueState::Idle);
    }

    #[test]
    fn decode_accepts_bytes() {
        let msg = decode(br#"{"type":"state","payload":{"queue_state":"accepted"}}"#).unwrap();
        assert_eq!(msg.payload.queue_state, QueueState::Accepted);
    }

    #[test]
    fn missing_queue_state_defaults_to_unknown() {
        let msg = decode(r#"{"type":"state","payload":{}}"#).unwrap();
        assert_eq!(msg.payload.queue_state, QueueState::Unknown);
    }

    #[test]
    fn null_queue_state_defaults_to_unknown() {
        let msg = decode(r#"{"type":"state","payload":{"queue_state":null}}"#).unwrap();
        assert_eq!(msg.payload.queue_state, QueueState::Unknown);
    }

    #[test]
    fn mistyped_payload_fields_are_dropped() {
        let msg = decode(
            r#"{"type":"state","payload":{"queue_state":"match_found","last_event":5,
                "auto_accept_enabled":"yes","last_match_found_at":{"at":1}}}"#,
        )
        .unwrap();
        assert_eq!(msg.payload.queue_state, QueueState::MatchFound);
        assert_eq!(msg.payload.last_event, None);
        assert_eq!(msg.payload.auto_accept_enabled, None);
        assert_eq!(msg.payload.last_match_found_at, None);
    }

    #[test]
    fn non_string_queue_state_is_unknown() {
        let msg = decode(r#"{"type":"state","payload":{"queue_state":7}}"#).unwrap();
        assert_eq!(msg.payload.queue_state, QueueState::Unknown);
    }

    #[test]
    fn missing_payload_is_an_error() {
        let err = decode(r#"{"type":"state"}"#).unwrap_err();
        assert!(matches!(err, QueueWatcherError::Decode(_)));
    }

    #[test]
    fn non_object_payload_is_an_error() {
        assert!(decode(r#"{"type":"state","payload":["idle"]}"#).is_err());
        assert!(decode(r#"{"type":"state","payload":null}"#).is_err());
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(decode("hello").is_err());
        assert!(decode("").is_err());
        assert!(decode([0xff, 0xfe]).is_err());
    }

    #[test]
    fn missing_type_is_not_a_state_frame() {
        let msg = decode(r#"{"payload":{"queue_state":"idle"}}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Other(String::new()));
        assert!(!msg.is_state());
    }

    #[test]
    fn extra_payload_keys_are_kept() {
        let msg = decode(
            r#"{"type":"state","payload":{"queue_state":"idle","auto_accept_enabled":false,"region":"eu"}}"#,
        )
        .unwrap();
        assert_eq!(msg.payload.auto_accept_enabled, Some(false));
        assert_eq!(msg.payload.extra.get("region").unwrap(), "eu");
    }

    #[test]
    fn toggle_and_empty_bodies() {
        assert_eq!(encode_toggle(true), br#"{"enabled":true}"#.to_vec());
        assert_eq!(encode_toggle(false), br#"{"enabled":false}"#.to_vec());
        assert_eq!(encode_empty(), b"{}".to_vec());
    }

    #[test]
    fn command_routes() {
        assert_eq!(Command::StartQueue.path(), "/start-queue");
        assert_eq!(Command::StopQueue.path(), "/stop-queue");
        assert_eq!(
            Command::ToggleAutoAccept { enabled: true }.path(),
            "/toggle-auto-accept"
        );
        assert_eq!(Command::StopQueue.body(), b"{}".to_vec());
    }

    #[test]
    fn queue_command_parsing() {
        assert_eq!(
            "start-queue".parse::<QueueCommand>().unwrap(),
            QueueCommand::StartQueue
        );
        assert_eq!(
            "/stop-queue".parse::<QueueCommand>().unwrap(),
            QueueCommand::StopQueue
        );
        let err = "toggle-auto-accept".parse::<QueueCommand>().unwrap_err();
        assert!(matches!(err, QueueWatcherError::UnknownCommand(_)));
        assert_eq!(QueueCommand::StartQueue.to_string(), "start-queue");
    }
}
