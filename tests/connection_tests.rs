#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Connection manager tests: state machine, frame delivery, reconnection,
//! and cancellation, driven through the scripted `MockConnector`.

mod common;

use std::time::Duration;

use queue_watcher::{BackoffPolicy, ConnectionManager, ConnectionState, QueueState};

use common::{
    assert_quiet, drain, fast_config, init_tracing, next, test_info, MockConnector,
    RecordingHandler, Seen,
};

async fn expect_states(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Seen>,
    expected: &[ConnectionState],
) {
    for state in expected {
        let seen = next(rx).await;
        assert_eq!(seen, Seen::State(*state), "expected state {state}");
    }
}

async fn expect_queue_state(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Seen>) -> QueueState {
    match next(rx).await {
        Seen::Message(msg) => msg.payload.queue_state,
        other => panic!("expected a message, got {other:?}"),
    }
}

// ════════════════════════════════════════════════════════════════════
// Frame delivery
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_delivers_frames_in_order() {
    init_tracing();
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;
    assert_eq!(manager.state(), ConnectionState::Connected);

    let server = next(&mut servers).await;
    let states = ["idle", "searching", "match_found", "accepted", "idle"];
    for state in states {
        server.push_state(state);
    }
    for state in states {
        assert_eq!(expect_queue_state(&mut seen).await, QueueState::from(state));
    }

    manager.close().await;
}

#[tokio::test]
async fn undecodable_frames_are_dropped() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;

    let server = next(&mut servers).await;
    server.push_raw("definitely not json");
    server.push_raw(r#"{"type":"state"}"#);
    server.push_raw(r#"{"type":"state","payload":"idle"}"#);
    server.push_raw("[1,2,3]");
    server.push_raw(r#"{"type":"state","payload":{}}"#);
    server.push_state("queued");

    assert_eq!(expect_queue_state(&mut seen).await, QueueState::Unknown);
    assert_eq!(expect_queue_state(&mut seen).await, QueueState::Queued);
    assert_quiet(&mut seen, Duration::from_millis(50)).await;
    // A bad frame is not a transport failure.
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.close().await;
}

#[tokio::test]
async fn unknown_frame_types_still_reach_the_handler() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;

    let server = next(&mut servers).await;
    server.push_raw(r#"{"type":"telemetry","payload":{"fps":60}}"#);
    match next(&mut seen).await {
        Seen::Message(msg) => {
            assert!(!msg.is_state());
            assert_eq!(msg.kind.as_str(), "telemetry");
        }
        other => panic!("expected a message, got {other:?}"),
    }

    manager.close().await;
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reconnects_after_transport_failure() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;
    let first = next(&mut servers).await;

    first.fail();
    expect_states(
        &mut seen,
        &[
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ],
    )
    .await;

    let second = next(&mut servers).await;
    assert!(first.is_closed(), "failed channel must be closed before reconnecting");
    assert_eq!(connector.live(), 1);

    second.push_state("searching");
    assert_eq!(expect_queue_state(&mut seen).await, QueueState::Searching);

    manager.close().await;
}

#[tokio::test]
async fn reconnects_after_server_hang_up() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;

    next(&mut servers).await.hang_up();
    expect_states(
        &mut seen,
        &[
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ],
    )
    .await;
    assert_eq!(connector.attempts(), 2);

    manager.close().await;
}

#[tokio::test]
async fn handshake_failures_drive_reconnecting() {
    let (connector, mut servers) = MockConnector::new(vec![false, false, true], true);
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ],
    )
    .await;
    assert_eq!(connector.attempts(), 3);

    next(&mut servers).await.push_state("idle");
    assert_eq!(expect_queue_state(&mut seen).await, QueueState::Idle);

    manager.close().await;
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let (connector, _servers) = MockConnector::always_failing();
    let (handler, mut seen) = RecordingHandler::new();
    let config = fast_config().with_backoff(
        BackoffPolicy::default()
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter_ratio(0.0)
            .with_max_attempts(2),
    );
    let mut manager = ConnectionManager::new(connector.clone(), &config);

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
        ],
    )
    .await;
    assert_eq!(connector.attempts(), 3);
    assert_quiet(&mut seen, Duration::from_millis(50)).await;
    assert!(!manager.is_active());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

// ════════════════════════════════════════════════════════════════════
// Cancellation and single-channel invariant
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn close_during_backoff_cancels_the_retry() {
    let (connector, _servers) = MockConnector::always_failing();
    let (handler, mut seen) = RecordingHandler::new();
    let config = fast_config().with_backoff(
        BackoffPolicy::default()
            .with_initial_delay(Duration::from_millis(300))
            .with_jitter_ratio(0.0),
    );
    let mut manager = ConnectionManager::new(connector.clone(), &config);

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Reconnecting],
    )
    .await;

    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_active());

    assert_quiet(&mut seen, Duration::from_millis(500)).await;
    assert_eq!(connector.attempts(), 1, "no retry may start after close");
}

#[tokio::test]
async fn close_while_connected_releases_the_channel() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;
    let server = next(&mut servers).await;

    manager.close().await;
    assert!(server.is_closed());
    assert_eq!(connector.live(), 0);

    server.push_state("match_found");
    assert_quiet(&mut seen, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn no_callbacks_after_close_returns() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler).await;
    let server = next(&mut servers).await;
    for _ in 0..500 {
        server.push_state("queued");
    }

    manager.close().await;
    // Whatever was delivered was delivered before close returned.
    drain(&mut seen);
    assert_quiet(&mut seen, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn second_connect_replaces_the_first_channel() {
    let (connector, mut servers) = MockConnector::always_ok();
    let (handler, mut seen) = RecordingHandler::new();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());

    manager.connect(test_info(), handler.clone()).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;
    let first = next(&mut servers).await;

    manager.connect(test_info(), handler).await;
    expect_states(
        &mut seen,
        &[ConnectionState::Connecting, ConnectionState::Connected],
    )
    .await;
    let second = next(&mut servers).await;

    assert!(first.is_closed());
    assert_eq!(connector.live(), 1);

    first.push_state("match_found");
    second.push_state("accepted");
    assert_eq!(expect_queue_state(&mut seen).await, QueueState::Accepted);
    assert_quiet(&mut seen, Duration::from_millis(100)).await;

    manager.close().await;
}

#[tokio::test]
async fn close_without_session_is_a_no_op() {
    let (connector, _servers) = MockConnector::always_ok();
    let mut manager = ConnectionManager::new(connector.clone(), &fast_config());
    manager.close().await;
    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 0);
}
