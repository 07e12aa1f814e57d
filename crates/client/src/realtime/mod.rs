//! Realtime push channel with automatic recovery.
//!
//! - [`policy`]: reconnect schedule
//! - [`link`]: transport abstraction and the WebSocket connector
//! - [`channel`]: connection state machine, subscriptions and outbound buffering

pub mod channel;
pub mod link;
pub mod policy;

pub use channel::{ConnectionStatus, RealtimeChannel};
pub use link::{LinkEvent, RealtimeConnector, RealtimeLink, WebSocketConnector};
pub use policy::{BackoffStrategy, ReconnectPolicy};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}
