//! WebSocket push transport.
//!
//! Each [`WebSocketTransport::open`] dials the configured `ws://` or `wss://`
//! URL with a timeout and yields a [`WebSocketChannel`]. Text frames are
//! passed through as [`Frame::Text`], binary frames as [`Frame::Binary`].
//! Ping/pong is handled by the socket layer and never surfaces.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Channel, Frame, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default timeout for the TCP + WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a push endpoint over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Creates a transport for `url` with the default connect timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    type Channel = WebSocketChannel;

    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Refused`] if the endpoint refuses the TCP connection.
    /// - [`TransportError::Io`] for TLS, HTTP upgrade, and other failures.
    async fn open(&self) -> Result<WebSocketChannel, TransportError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "push WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, err = %e, "push WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;
        tracing::debug!(url = %self.url, "push WebSocket open");
        Ok(WebSocketChannel { stream })
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// One open WebSocket push channel.
pub struct WebSocketChannel {
    stream: WsStream,
}

impl Channel for WebSocketChannel {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(Frame::Text(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => return Ok(Frame::Binary(data.to_vec())),
                Ok(Message::Close(_)) => {
                    tracing::info!("push WebSocket closed by server");
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => {
                    tracing::warn!(err = %e, "push WebSocket read error");
                    return Err(TransportError::Io(std::io::Error::other(e.to_string())));
                }
            }
        }
        Err(TransportError::ConnectionClosed)
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(err = %e, "push WebSocket close failed");
        }
    }
}

fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Refused(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "push endpoint HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "push connection error: {other}"
        ))),
    }
}
