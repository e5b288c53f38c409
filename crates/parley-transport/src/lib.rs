//! # parley-transport
//!
//! Transport abstraction layer for the Parley chat client.
//!
//! This crate provides a unified interface for reaching the per-channel
//! event stream:
//!
//! - **WebSocket** - The production transport
//! - **Memory** - In-process loopback for tests (feature `memory`)
//!
//! On top of the transports sits [`TransportSession`], which owns one live
//! connection, runs it on its own task, and reports lifecycle events
//! (`Opened`, `Frame`, `Closed`, `Error`) on a queue.
//!
//! ```rust,ignore
//! use parley_transport::{ConnectParams, TransportSession};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let session = TransportSession::open(transport, ConnectParams::new("general", "ada@example.com"), 1, tx);
//! while let Some(msg) = rx.recv().await {
//!     // Route msg.event
//! }
//! ```

pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use session::{Generation, SessionEvent, SessionMessage, TransportSession};
pub use traits::{ConnectParams, Connection, ConnectionId, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[cfg(any(test, feature = "memory"))]
pub use memory::{MemoryHub, MemoryTransport};
