//! History loading.
//!
//! A [`HistoryLoader`] fetches a bounded page of the most recent messages of
//! a channel when the channel is activated. Failures are recoverable: the
//! controller logs them and leaves the collection as it is.

use async_trait::async_trait;
use parley_protocol::Message;
use thiserror::Error;

/// History fetch errors.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
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
    #[error("Server rejected request: {0}")]
    Rejected(String),

    /// The response body could not be decoded.
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Source of channel history.
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    /// Fetch up to `limit` of the newest messages of a channel, newest first.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] on network or decoding failure.
    async fn load(&self, channel_id: &str, limit: usize) -> Result<Vec<Message>, FetchError>;
}
