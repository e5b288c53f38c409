//! Outbound message submission.
//!
//! Sending never touches the message store: the persisted message comes back
//! through the event stream like any other.

use async_trait::async_trait;
use thiserror::Error;

/// Message submission errors.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// The request could not be sent or the connection broke.
    #[error("Request failed: {0}")]
    Network(String),

    /// The server answered with a non-success HTTP status.
    #[error("Server returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The server reported the request as unsuccessful.
    #[error("Server rejected message: {0}")]
    Rejected(String),
}

/// Submits new messages to the server.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Submit `content` to a channel on behalf of the configured user.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] if the server did not accept the message.
    async fn send(&self, channel_id: &str, content: &str) -> Result<(), SendError>;
}
