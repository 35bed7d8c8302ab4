#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Command channel tests: `HttpCommandTransport` against a bare TCP server,
//! and `CommandRelay` failure accounting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use queue_watcher::{
    Command, CommandRelay, CommandTransport, ConnectionInfo, HttpCommandTransport,
    QueueWatcherError,
};

use common::RecordingCommands;

/// Serve exactly one HTTP request, answering with `status_line`.
async fn one_shot_server(status_line: &'static str) -> (u16, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let response =
            format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = tx.send(request);
    });

    (port, rx)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map_or(0, |len| len.trim().parse::<usize>().unwrap());
        if buf.len() >= head_end + 4 + body_len {
            break;
        }
    }
    String::from_utf8(buf).unwrap()
}

fn http() -> HttpCommandTransport {
    HttpCommandTransport::new(Duration::from_secs(2)).unwrap()
}

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ════════════════════════════════════════════════════════════════════
// HttpCommandTransport
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn posts_json_with_auth_header() {
    let (port, request) = one_shot_server("HTTP/1.1 200 OK").await;
    let info = ConnectionInfo::new("127.0.0.1", port, "s3cret").unwrap();
    let command = Command::ToggleAutoAccept { enabled: true };

    tokio_test::assert_ok!(
        http()
            .post(&info.command_url(command.path()), info.token(), command.body())
            .await
    );

    let request = request.await.unwrap();
    let lower = request.to_ascii_lowercase();
    assert!(
        request.starts_with("POST /toggle-auto-accept HTTP/1.1\r\n"),
        "unexpected request line: {request}"
    );
    assert!(lower.contains("\r\nx-auth-token: s3cret\r\n"));
    assert!(lower.contains("\r\ncontent-type: application/json\r\n"));
    assert!(request.ends_with("\r\n\r\n{\"enabled\":true}"));
}

#[tokio::test]
async fn rejected_token_is_an_error() {
    let (port, _request) = one_shot_server("HTTP/1.1 401 Unauthorized").await;
    let info = ConnectionInfo::new("127.0.0.1", port, "wrong").unwrap();

    let err = http()
        .post(&info.command_url("/start-queue"), info.token(), b"{}".to_vec())
        .await
        .unwrap_err();
    match err {
        QueueWatcherError::Command(e) => {
            assert_eq!(e.status().map(|s| s.as_u16()), Some(401));
        }
        other => panic!("expected a command error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_an_error() {
    let port = closed_port().await;
    let result = http()
        .post(
            &format!("http://127.0.0.1:{port}/stop-queue"),
            "tok",
            b"{}".to_vec(),
        )
        .await;
    assert!(matches!(result, Err(QueueWatcherError::Command(_))));
}

// ════════════════════════════════════════════════════════════════════
// CommandRelay
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn relay_counts_unreachable_server_without_blocking() {
    let port = closed_port().await;
    let info = ConnectionInfo::new("127.0.0.1", port, "tok").unwrap();
    let relay = CommandRelay::start(Arc::new(http()));

    relay.send(&info, Command::StartQueue);
    relay.send(&info, Command::StopQueue);

    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.failures() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failures were not counted");
}

#[tokio::test]
async fn relay_preserves_submission_order() {
    let commands = Arc::new(RecordingCommands::default());
    let relay = CommandRelay::start(commands.clone());
    let info = common::test_info();

    for enabled in [true, false, true, true] {
        relay.send(&info, Command::ToggleAutoAccept { enabled });
    }
    relay.send(&info, Command::StopQueue);

    let bodies: Vec<String> = commands
        .wait_for(5)
        .await
        .into_iter()
        .map(|r| r.body)
        .collect();
    assert_eq!(
        bodies,
        [
            r#"{"enabled":true}"#,
            r#"{"enabled":false}"#,
            r#"{"enabled":true}"#,
            r#"{"enabled":true}"#,
            "{}",
        ]
    );
    assert_eq!(relay.failures(), 0);
}
