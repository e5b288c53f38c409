//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Each connection is scoped to one channel: the channel and the acting user
//! travel as query parameters, and the user is repeated in the `User-Email`
//! handshake header.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parley_protocol::api::{USER_EMAIL_HEADER, WS_PATH};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};
use url::Url;

use crate::traits::{ConnectParams, Connection, ConnectionId, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Event stream endpoint, without query parameters.
    pub endpoint: String,
    /// Upper bound on the handshake.
    pub connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("ws://localhost:3000{}", WS_PATH),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConfig {
    /// Derive the stream endpoint from the HTTP API base URL.
    ///
    /// `http` maps to `ws` and `https` to `wss`; the path is replaced by the
    /// stream path.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed or has another scheme.
    pub fn from_server_url(server_url: &str) -> Result<Self, TransportError> {
        let mut url = Url::parse(server_url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", server_url, e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidEndpoint(server_url.to_string()))?;
        url.set_path(WS_PATH);
        url.set_query(None);

        Ok(Self {
            endpoint: url.to_string(),
            ..Default::default()
        })
    }
}

/// WebSocket client transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    endpoint: Url,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a `ws://` or `wss://` URL.
    pub fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", config.endpoint, e)))?;

        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "expected ws:// or wss://, got {}",
                config.endpoint
            )));
        }

        Ok(Self { endpoint, config })
    }

    /// Full URL for one connection, query parameters included.
    #[must_use]
    pub fn connection_url(&self, params: &ConnectParams) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("channel_id", &params.channel_id)
            .append_pair("user_email", &params.user_email);
        url
    }

    /// The configured handshake timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, TransportError> {
        let url = self.connection_url(params);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let identity = HeaderValue::from_str(&params.user_email)
            .map_err(|e| TransportError::Other(format!("Invalid user identity: {}", e)))?;
        request.headers_mut().insert(USER_EMAIL_HEADER, identity);

        debug!(channel = %params.channel_id, endpoint = %self.endpoint, "Connecting");

        let (stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                error!(channel = %params.channel_id, "WebSocket handshake failed: {}", e);
                TransportError::ConnectFailed(e.to_string())
            })?;

        let conn = WebSocketConnection::new(stream);
        debug!(channel = %params.channel_id, connection = %conn.id, "WebSocket handshake completed");

        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A WebSocket client connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: bool,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            is_open: true,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!(connection = %self.id, "Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    debug!(connection = %self.id, "Connection closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, "WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
