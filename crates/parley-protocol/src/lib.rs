//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat client.
//!
//! This crate defines the records exchanged with the chat server, the event
//! frames pushed over the per-channel stream, and the JSON shapes of the HTTP
//! API.
//!
//! ## Event Types
//!
//! - `new_message` - A message was created
//! - `message_updated` - A message was edited
//! - `message_deleted` - A message was removed
//! - `connected` - Welcome frame sent when the stream opens
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame, ServerEvent};
//!
//! let frame = Frame::message_deleted("general", "m1");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.event, ServerEvent::MessageDeleted { id: "m1".into() });
//! ```

pub mod api;
pub mod codec;
pub mod frames;
pub mod models;

pub use codec::{decode, decode_batch, encode, FrameCodec, ProtocolError};
pub use frames::{EventType, Frame, ServerEvent};
pub use models::{Channel, ChannelId, Message, MessageId};
