//! Event frames pushed by the server over the per-channel stream.
//!
//! Every frame is a JSON object discriminated by its `type` field. The
//! payload lives under `data`; the envelope may also carry the channel the
//! event belongs to and a server timestamp.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;
use crate::models::{ChannelId, Message, MessageId};

/// Event type identifiers as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connected,
    NewMessage,
    MessageUpdated,
    MessageDeleted,
}

impl EventType {
    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::NewMessage => "new_message",
            EventType::MessageUpdated => "message_updated",
            EventType::MessageDeleted => "message_deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for EventType {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "connected" => Ok(EventType::Connected),
            "new_message" => Ok(EventType::NewMessage),
            "message_updated" => Ok(EventType::MessageUpdated),
            "message_deleted" => Ok(EventType::MessageDeleted),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Welcome frame sent once the server registered the connection.
    Connected {
        /// Identity the server attached to the connection.
        user_email: Option<String>,
    },
    /// A message was created.
    NewMessage(Message),
    /// A message was edited. Identity and timestamp are unchanged.
    MessageUpdated(Message),
    /// A message was removed.
    MessageDeleted {
        /// Identifier of the removed message.
        id: MessageId,
    },
}

impl ServerEvent {
    /// Get the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ServerEvent::Connected { .. } => EventType::Connected,
            ServerEvent::NewMessage(_) => EventType::NewMessage,
            ServerEvent::MessageUpdated(_) => EventType::MessageUpdated,
            ServerEvent::MessageDeleted { .. } => EventType::MessageDeleted,
        }
    }
}

/// A protocol frame: one event plus its envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawFrame", try_from = "RawFrame")]
pub struct Frame {
    /// Channel the event was broadcast to, when the server includes it.
    pub channel_id: Option<ChannelId>,
    /// Server-side send time, kept verbatim.
    pub timestamp: Option<String>,
    /// The event itself.
    pub event: ServerEvent,
}

impl Frame {
    /// Create a frame without envelope metadata.
    #[must_use]
    pub fn new(event: ServerEvent) -> Self {
        Self {
            channel_id: None,
            timestamp: None,
            event,
        }
    }

    /// Create a `new_message` frame scoped to the message's channel.
    #[must_use]
    pub fn new_message(message: Message) -> Self {
        Self {
            channel_id: Some(message.channel_id.clone()),
            timestamp: None,
            event: ServerEvent::NewMessage(message),
        }
    }

    /// Create a `message_updated` frame scoped to the message's channel.
    #[must_use]
    pub fn message_updated(message: Message) -> Self {
        Self {
            channel_id: Some(message.channel_id.clone()),
            timestamp: None,
            event: ServerEvent::MessageUpdated(message),
        }
    }

    /// Create a `message_deleted` frame.
    #[must_use]
    pub fn message_deleted(channel_id: impl Into<ChannelId>, id: impl Into<MessageId>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            timestamp: None,
            event: ServerEvent::MessageDeleted { id: id.into() },
        }
    }

    /// Create the welcome frame.
    #[must_use]
    pub fn connected(channel_id: impl Into<ChannelId>, user_email: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            timestamp: None,
            event: ServerEvent::Connected {
                user_email: Some(user_email.into()),
            },
        }
    }

    /// Set the envelope timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Get the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }
}

/// Envelope exactly as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

/// Payload of `message_deleted`; the server also sends channel and author.
#[derive(Debug, Serialize, Deserialize)]
struct DeletedRef {
    id: MessageId,
}

impl TryFrom<RawFrame> for Frame {
    type Error = ProtocolError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        let kind = EventType::try_from(raw.kind.as_str())?;

        let event = match kind {
            EventType::Connected => ServerEvent::Connected {
                user_email: raw.user_email,
            },
            EventType::NewMessage => ServerEvent::NewMessage(payload(kind, raw.data)?),
            EventType::MessageUpdated => ServerEvent::MessageUpdated(payload(kind, raw.data)?),
            EventType::MessageDeleted => {
                let deleted: DeletedRef = payload(kind, raw.data)?;
                ServerEvent::MessageDeleted { id: deleted.id }
            }
        };

        Ok(Frame {
            channel_id: raw.channel_id,
            timestamp: raw.timestamp,
            event,
        })
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: EventType,
    data: Option<serde_json::Value>,
) -> Result<T, ProtocolError> {
    let data = data.ok_or(ProtocolError::MissingData(kind.as_str()))?;
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData {
        event: kind.as_str(),
        source,
    })
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        let kind = frame.event_type().as_str().to_string();
        let (user_email, data) = match frame.event {
            ServerEvent::Connected { user_email } => (user_email, None),
            ServerEvent::NewMessage(msg) | ServerEvent::MessageUpdated(msg) => {
                (None, serde_json::to_value(msg).ok())
            }
            ServerEvent::MessageDeleted { id } => (None, serde_json::to_value(DeletedRef { id }).ok()),
        };

        RawFrame {
            kind,
            channel_id: frame.channel_id,
            user_email,
            timestamp: frame.timestamp,
            data,
        }
    }
}
