//! WebSocket status channel using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] opens `ws://{host}:{port}/ws?token={token}` for a
//! [`ConnectionInfo`] and wraps the stream in a [`WebSocketTransport`].
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), queue_watcher::QueueWatcherError> {
//! use queue_watcher::{ConnectionInfo, Connector, Transport, WebSocketConnector};
//! use std::time::Duration;
//!
//! let info = ConnectionInfo::new("192.168.1.20", 8765, "s3cret")?;
//! let connector = WebSocketConnector::new(Duration::from_secs(5));
//! let mut transport = connector.connect(&info).await?;
//!
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("status: {frame}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::config::ConnectionInfo;
use crate::error::QueueWatcherError;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketTransport`] from an
/// existing stream via [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any frames,
/// making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::Connect`] if the URL is invalid, the
    /// server is unreachable, or it refuses the upgrade (for example because
    /// the token is wrong).
    pub async fn connect(url: &str) -> Result<Self, QueueWatcherError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| QueueWatcherError::Connect(e.to_string()))?;

        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Create a [`WebSocketTransport`] from an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Establish a new WebSocket connection with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`QueueWatcherError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: Duration,
    ) -> Result<Self, QueueWatcherError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| QueueWatcherError::Timeout)?
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<Result<String, QueueWatcherError>> {
        if self.closed {
            return Some(Err(QueueWatcherError::TransportClosed));
        }
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(QueueWatcherError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite answers pings itself.
                }
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), QueueWatcherError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| QueueWatcherError::TransportReceive(e.to_string()))
    }
}

/// Opens [`WebSocketTransport`]s to the control server's status endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn Transport>, QueueWatcherError> {
        let url = info.status_url()?;
        tracing::debug!(host = %info.host(), port = info.port(), "opening status channel");

        let transport = WebSocketTransport::connect_with_timeout(&url, self.connect_timeout).await?;

        tracing::info!(host = %info.host(), port = info.port(), "status channel established");
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
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
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueWatcherError::Connect(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueWatcherError::Connect(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Non-routable address.
        let err = WebSocketTransport::connect_with_timeout("ws://192.0.2.1:1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueWatcherError::Timeout));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection. Returns the bound port and the request URI the client used.
    async fn start_mock_server<F, Fut>(handler: F) -> (u16, Arc<Mutex<Option<String>>>)
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&uri);

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(
                tcp,
                |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *seen.lock().unwrap() = Some(req.uri().to_string());
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            handler(ws).await;
        });

        (port, uri)
    }

    fn local_info(port: u16) -> ConnectionInfo {
        ConnectionInfo::new("127.0.0.1", port, "tok en").unwrap()
    }

    #[tokio::test]
    async fn connector_uses_status_path_and_token() {
        let (port, uri) = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new(Duration::from_secs(5));
        let mut transport = connector.connect(&local_info(port)).await.unwrap();
        assert!(transport.recv().await.is_none());

        assert_eq!(uri.lock().unwrap().as_deref(), Some("/ws?token=tok+en"));
    }

    #[tokio::test]
    async fn connector_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebSocketConnector::new(Duration::from_secs(5));
        let err = connector.connect(&local_info(port)).await.err().unwrap();
        assert!(matches!(err, QueueWatcherError::Connect(_)));
    }

    #[tokio::test]
    async fn recv_receives_text_frames_in_order() {
        let (port, _uri) = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("first".into())).await.unwrap();
            ws.send(Message::Text("second".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new(Duration::from_secs(5));
        let mut transport = connector.connect(&local_info(port)).await.unwrap();

        assert_eq!(transport.recv().await.unwrap().unwrap(), "first");
        assert_eq!(transport.recv().await.unwrap().unwrap(), "second");
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let (port, _uri) = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let url = format!("ws://127.0.0.1:{port}/ws");
        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_recv() {
        let (port, _uri) =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let url = format!("ws://127.0.0.1:{port}/ws");
        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, QueueWatcherError::TransportClosed));
    }

    #[tokio::test]
    async fn from_stream_constructor_works() {
        let (port, _uri) = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("from_stream_msg".into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let url = format!("ws://127.0.0.1:{port}/ws");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let mut transport = WebSocketTransport::from_stream(ws_stream);

        assert_eq!(transport.recv().await.unwrap().unwrap(), "from_stream_msg");
    }
}
