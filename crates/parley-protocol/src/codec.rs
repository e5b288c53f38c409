//! Codec for encoding and decoding Parley event frames.
//!
//! Frames are JSON objects. The server coalesces queued frames into a single
//! transport message separated by newlines, so decoding works on batches:
//! each line is decoded on its own and a malformed line never takes its
//! siblings down with it.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Frame, RawFrame};

/// Default maximum size of one frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Separator between coalesced frames.
pub const FRAME_SEPARATOR: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeds the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Not valid JSON, or not a JSON object with a `type`.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` field names an event this client does not know.
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    /// The event requires a `data` payload and none was sent.
    #[error("Missing data for {0} event")]
    MissingData(&'static str),

    /// The `data` payload does not match the event's shape.
    #[error("Invalid data for {event} event: {source}")]
    InvalidData {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Short label used for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "too_large",
            ProtocolError::Json(_) => "malformed",
            ProtocolError::UnknownEvent(_) => "unknown_event",
            ProtocolError::MissingData(_) | ProtocolError::InvalidData { .. } => "invalid_data",
        }
    }
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(frame)?;
    Ok(Bytes::from(payload))
}

/// Encode several frames into one newline-separated transport message.
///
/// # Errors
///
/// Returns an error if serialization of any frame fails.
pub fn encode_batch(frames: &[Frame]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            buf.put_u8(FRAME_SEPARATOR);
        }
        buf.extend_from_slice(&serde_json::to_vec(frame)?);
    }
    Ok(buf.freeze())
}

/// Decode exactly one frame.
///
/// # Errors
///
/// Returns an error if the data is not a well-formed frame of a known type.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let raw: RawFrame = serde_json::from_slice(data)?;
    Frame::try_from(raw)
}

/// Decode every frame in a transport message.
///
/// Returns one result per non-blank line, in order. The size limit applies
/// to each line, so an oversized frame is rejected on its own.
#[must_use]
pub fn decode_batch(data: &[u8], max_frame_size: usize) -> Vec<Result<Frame, ProtocolError>> {
    data.split(|b| *b == FRAME_SEPARATOR)
        .map(trim_ascii)
        .filter(|line| !line.is_empty())
        .map(|line| decode_bounded(line, max_frame_size))
        .collect()
}

fn decode_bounded(line: &[u8], max_frame_size: usize) -> Result<Frame, ProtocolError> {
    if line.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: line.len(),
            max: max_frame_size,
        });
    }
    decode(line)
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if first.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = line {
        if last.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// Codec carrying the size limit for one connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a new codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with a custom size limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The size limit in bytes.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        encode(frame)
    }

    /// Decode every frame in a transport message.
    #[must_use]
    pub fn decode_batch(&self, data: &[u8]) -> Vec<Result<Frame, ProtocolError>> {
        decode_batch(data, self.max_frame_size)
    }
}
