//! Domain records shared by the HTTP API and the event stream.
//!
//! The server is the source of truth for both records; the client only
//! holds reconstructable copies of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque channel identifier.
pub type ChannelId = String;

/// Opaque message identifier.
pub type MessageId = String;

/// A named topic grouping messages and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel identifier.
    pub id: ChannelId,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Email of the user that created the channel.
    #[serde(default)]
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Author identity.
    pub user_email: String,
    /// Message text.
    pub content: String,
    /// Creation time, used for ordering.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        id: impl Into<MessageId>,
        channel_id: impl Into<ChannelId>,
        user_email: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            user_email: user_email.into(),
            content: content.into(),
            created_at,
        }
    }

    /// Replace the content, keeping identity and timestamp.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}
