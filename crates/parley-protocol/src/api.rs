//! Request and response bodies of the HTTP API.
//!
//! Every response carries a `success` flag and a human-readable `message`.
//! Collections are omitted entirely when empty, so they default to empty.

use serde::{Deserialize, Serialize};

use crate::models::{Channel, ChannelId, Message};

/// Header carrying the acting user's identity on every request.
pub const USER_EMAIL_HEADER: &str = "User-Email";

/// Default number of messages requested when a channel is activated.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Body of `POST /api/v1/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub channel_id: ChannelId,
    pub content: String,
}

/// Response of `POST /api/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Message>,
}

/// Response of `GET /api/v1/channels/{id}/messages`.
///
/// Messages are sorted by creation time, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

/// Response of `GET /api/v1/channels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
}

/// Path segments of the history endpoint for a channel.
///
/// The id is an opaque segment; callers must percent-encode it.
#[must_use]
pub fn history_segments(channel_id: &str) -> [&str; 5] {
    ["api", "v1", "channels", channel_id, "messages"]
}

/// Path of the message submission endpoint.
pub const MESSAGES_PATH: &str = "/api/v1/messages";

/// Path of the channel listing endpoint.
pub const CHANNELS_PATH: &str = "/api/v1/channels";

/// Path of the event stream endpoint.
pub const WS_PATH: &str = "/api/v1/ws";
