//! # Watch Queue Example
//!
//! Watches a control server's matchmaking queue from the terminal:
//!
//! 1. Build connection info from a pairing payload or from host/port/token
//! 2. Start the watcher and print every status line and alert
//! 3. Relay commands typed on stdin to the server
//! 4. Stop cleanly on Ctrl+C
//!
//! ## Running
//!
//! ```sh
//! # Paste the JSON encoded in the server's pairing QR code:
//! QUEUE_WATCHER_PAIRING='{"host":"192.168.1.20","port":8765,"token":"s3cret"}' \
//!     cargo run --example watch_queue
//!
//! # Or give the parts separately (port defaults to 8765):
//! QUEUE_WATCHER_HOST=192.168.1.20 QUEUE_WATCHER_TOKEN=s3cret \
//!     cargo run --example watch_queue
//! ```
//!
//! Type `start-queue`, `stop-queue`, `auto on` or `auto off` and press Enter.

use tokio::io::{AsyncBufReadExt, BufReader};

use queue_watcher::protocol::DEFAULT_PORT;
use queue_watcher::{Alert, ConnectionInfo, QueueCommand, QueueWatcher, WatcherConfig, WatcherEvent};

fn connection_info() -> Result<ConnectionInfo, Box<dyn std::error::Error>> {
    if let Ok(payload) = std::env::var("QUEUE_WATCHER_PAIRING") {
        return Ok(ConnectionInfo::from_pairing_payload(&payload)?);
    }
    let host = std::env::var("QUEUE_WATCHER_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("QUEUE_WATCHER_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
    let token = std::env::var("QUEUE_WATCHER_TOKEN")?;
    Ok(ConnectionInfo::parse(&host, &port, &token)?)
}

fn handle_line(watcher: &QueueWatcher, line: &str) -> Result<(), queue_watcher::QueueWatcherError> {
    match line.trim() {
        "" => Ok(()),
        "auto on" => watcher.set_auto_accept(true),
        "auto off" => watcher.set_auto_accept(false),
        other => watcher.issue(other.parse::<QueueCommand>()?),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=queue_watcher=debug` for connection details.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Start ───────────────────────────────────────────────────────
    let info = connection_info()?;
    tracing::info!("Watching {}", info.authority());

    let (watcher, mut events) = QueueWatcher::new(WatcherConfig::default())?;
    watcher.start(info).await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    WatcherEvent::Status(line) => println!("{line}"),
                    WatcherEvent::Alert(Alert::MatchFound) => println!("*** MATCH FOUND ***"),
                    WatcherEvent::Alert(Alert::MatchAccepted) => println!("*** MATCH ACCEPTED ***"),
                    WatcherEvent::AutoAcceptReported(enabled) => {
                        println!("Auto-accept is {}", if enabled { "on" } else { "off" });
                    }
                    WatcherEvent::ConnectionChanged(_) => {}
                }
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = handle_line(&watcher, &line) {
                            tracing::warn!("{e}");
                        }
                    }
                    // Keep watching until Ctrl+C.
                    Ok(None) => stdin_open = false,
                    Err(e) => return Err(e.into()),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, stopping");
                break;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    watcher.stop().await;
    tracing::info!("Stopped");
    Ok(())
}
