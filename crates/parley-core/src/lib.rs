//! # parley-core
//!
//! Per-channel synchronization engine for the Parley chat client.
//!
//! This crate provides the pieces that keep one channel's view consistent:
//!
//! - **MessageStore** - Ordered, duplicate-free message collection
//! - **HistoryLoader** - Fetches recent messages when a channel is activated
//! - **MessageSender** - Submits new messages
//! - **ApiClient** - HTTP implementation of both
//! - **ChannelSessionController** - State machine tying them to a transport session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  history   ┌──────────────────────────┐
//! │   ApiClient │──────────▶ │                          │     ┌──────────────┐
//! └─────────────┘            │ ChannelSessionController │────▶│ MessageStore │
//! ┌──────────────────┐ events│                          │     └──────────────┘
//! │ TransportSession │─────▶ │                          │
//! └──────────────────┘       └──────────────────────────┘
//!                                        │
//!                                        ▼
//!                                  SessionUpdate
//! ```

pub mod api;
pub mod controller;
pub mod history;
pub mod metrics;
pub mod reconciler;
pub mod sender;

pub use api::{ApiClient, ApiError};
pub use controller::{
    ChannelSessionController, ConnectionState, ControllerConfig, ControllerError,
    ControllerEvent, ControllerState, ControllerStats, RetryPolicy, SessionUpdate,
};
pub use history::{FetchError, HistoryLoader};
pub use reconciler::{Inserted, MessageStore};
pub use sender::{MessageSender, SendError};
