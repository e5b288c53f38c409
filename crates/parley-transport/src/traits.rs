//! Transport abstraction traits for Parley.
//!
//! These traits define the interface that all client transports must
//! provide, allowing the session layer to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use parley_protocol::ChannelId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the handshake.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connection attempt timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Endpoint URL is not usable.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// What a connection is opened for: one channel, on behalf of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectParams {
    /// Channel whose events the connection carries.
    pub channel_id: ChannelId,
    /// Identity of the acting user.
    pub user_email: String,
}

impl ConnectParams {
    /// Create connection parameters.
    #[must_use]
    pub fn new(channel_id: impl Into<ChannelId>, user_email: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_email: user_email.into(),
        }
    }
}

/// A transport that can open connections to the event stream.
///
/// Transports are responsible for the underlying protocol (WebSocket,
/// in-memory, etc.) and provide a uniform interface to the session layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for the given channel and user.
    ///
    /// Resolves once the connection is established and ready to deliver
    /// frames.
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open connection to the event stream.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next transport message.
    ///
    /// A message may hold several newline-separated frames. Returns `None`
    /// if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
