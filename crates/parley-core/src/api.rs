//! HTTP client for the chat server's REST API.
//!
//! [`ApiClient`] implements both [`HistoryLoader`] and [`MessageSender`] and
//! also lists channels for the binary. Every request carries the acting
//! user's identity in the `User-Email` header.

use async_trait::async_trait;
use parley_protocol::api::{
    history_segments, ChannelsResponse, CreateMessageRequest, MessageResponse, MessagesResponse,
    CHANNELS_PATH, MESSAGES_PATH, USER_EMAIL_HEADER,
};
use parley_protocol::{Channel, Message};
use reqwest::{Client, RequestBuilder, Response, Url};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::{FetchError, HistoryLoader};
use crate::metrics;
use crate::sender::{MessageSender, SendError};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors building an [`ApiClient`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// The base URL is not an absolute http(s) URL.
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// The underlying HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// REST client bound to one server and one user identity.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    base_url: String,
    user_email: String,
}

impl ApiClient {
    /// Create a client for `base_url` acting as `user_email`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not http(s) or the client cannot be built.
    pub fn new(base_url: &str, user_email: impl Into<String>) -> Result<Self, ApiError> {
        let url = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let http = Client::builder().timeout(DEFAULT_REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            base: url,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_email: user_email.into(),
        })
    }

    /// Server base URL, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Identity attached to every request.
    #[must_use]
    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn history_url(&self, channel_id: &str) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(history_segments(channel_id));
        }
        url
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(USER_EMAIL_HEADER, &self.user_email)
    }

    /// List all channels.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] on network or decoding failure.
    pub async fn list_channels(&self) -> Result<Vec<Channel>, FetchError> {
        let response = self
            .authed(self.http.get(self.url(CHANNELS_PATH)))
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let body: ChannelsResponse = read_body(response).await?;
        if !body.success {
            return Err(FetchError::Rejected(body.message));
        }
        Ok(body.channels)
    }
}

/// Decode a JSON body, preferring the server's own message on error statuses.
async fn read_body<T>(response: Response) -> Result<T, FetchError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::Network(e.to_string()))?;

    if !status.is_success() {
        return match serde_json::from_slice::<MessageResponse>(&bytes) {
            Ok(body) if !body.message.is_empty() => Err(FetchError::Rejected(body.message)),
            _ => Err(FetchError::Status {
                status: status.as_u16(),
            }),
        };
    }

    serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
}

#[async_trait]
impl HistoryLoader for ApiClient {
    async fn load(&self, channel_id: &str, limit: usize) -> Result<Vec<Message>, FetchError> {
        let started = Instant::now();
        let response = self
            .authed(self.http.get(self.history_url(channel_id)))
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let body: MessagesResponse = read_body(response).await?;
        if !body.success {
            return Err(FetchError::Rejected(body.message));
        }

        metrics::record_history_latency(started.elapsed());
        debug!(
            channel = %channel_id,
            count = body.messages.len(),
            "Loaded channel history"
        );
        Ok(body.messages)
    }
}

#[async_trait]
impl MessageSender for ApiClient {
    async fn send(&self, channel_id: &str, content: &str) -> Result<(), SendError> {
        let request = CreateMessageRequest {
            channel_id: channel_id.to_string(),
            content: content.to_string(),
        };

        let response = self
            .authed(self.http.post(self.url(MESSAGES_PATH)))
            .json(&request)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let body: MessageResponse = read_body(response).await.map_err(|e| match e {
            FetchError::Network(reason) | FetchError::Decode(reason) => SendError::Network(reason),
            FetchError::Status { status } => SendError::Status { status },
            FetchError::Rejected(reason) => SendError::Rejected(reason),
        })?;

        if !body.success {
            warn!(channel = %channel_id, reason = %body.message, "Message rejected");
            return Err(SendError::Rejected(body.message));
        }
        Ok(())
    }
}
