//! # sona-realtime
//!
//! The realtime client layer of the sona relay: one upstream WebSocket,
//! a reconstructed conversation model, and the session operations that
//! drive both.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `types` | Wire-shaped data model: items, responses, session config |
//! | `upstream` | Upstream WebSocket lifecycle, pumps, keepalive, envelope stamping |
//! | `conversation` | Stateful reconstruction of items/responses from streamed events |
//! | `session` | Caller-facing session operations, tool registry, event wiring |
//!
//! ## Data Flow
//!
//! `upstream` republishes every inbound envelope on its bus
//! (`server.<type>` / `server.*`); `session` routes those into
//! `conversation`, which folds deltas into items and reports incremental
//! updates that `session` re-dispatches on its own bus
//! (`conversation.updated`, `conversation.item.appended`, …).

#![deny(unsafe_code)]

pub mod conversation;
pub mod session;
pub mod types;
pub mod upstream;

pub use conversation::{Conversation, EngineUpdate};
pub use session::{SessionController, ToolHandlerFuture};
pub use types::{
    AudioFormat, ContentPart, Formatted, FormattedTool, Item, ItemDelta, ItemDetail, ItemStatus,
    MaxOutputTokens, Response, ResponseStatus, Role, SessionConfig, SessionUpdate, ToolChoice,
    ToolDefinition, TurnDetection, UserContent,
};
pub use upstream::{UpstreamConfig, UpstreamConnection, DEFAULT_MODEL, DEFAULT_UPSTREAM_URL};

use sona_core::errors::{ConnectionError, ProtocolError, ValidationError};
use thiserror::Error;

/// Umbrella error for session and connection operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport lifecycle failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A single event violated the wire contract.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session operation was given invalid input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An event handler registered on a bus failed.
    #[error("event handler failed: {0}")]
    Handler(#[from] sona_bus::BoxError),

    /// Payload serialization failed.
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}
