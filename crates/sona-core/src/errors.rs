//! Shared error taxonomy for the relay.
//!
//! Three families, matching where the failure is surfaced:
//!
//! - [`ConnectionError`] — transport lifecycle failures, returned to the
//!   caller of the connection operation.
//! - [`ProtocolError`] — a single event violated the wire contract; fatal to
//!   that event only, the caller decides whether to tolerate it.
//! - [`ValidationError`] — a session operation was given bad input; raised
//!   synchronously, never deferred.

use thiserror::Error;

/// Transport lifecycle failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// `connect` was called on a live connection.
    #[error("already connected; disconnect first")]
    AlreadyConnected,

    /// An operation that requires a live connection ran without one.
    #[error("not connected")]
    NotConnected,

    /// No API credential was configured for the upstream handshake.
    #[error("no api key configured for upstream connection")]
    MissingCredential,

    /// The WebSocket handshake failed.
    #[error("could not connect to {url}: {reason}")]
    ConnectFailed {
        /// Upstream endpoint that refused the handshake.
        url: String,
        /// Underlying transport error, stringified.
        reason: String,
    },

    /// The connection dropped while an operation was in flight.
    #[error("upstream connection closed")]
    Closed,
}

/// A single inbound or outbound event violated the wire contract.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A required identification field was absent.
    #[error("missing {field:?} on event")]
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },

    /// A field was present but undecodable.
    #[error("invalid {field:?} on event: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Decode failure, stringified.
        reason: String,
    },

    /// No processor is registered for this event type.
    #[error("no event processor registered for {0:?}")]
    UnknownEventType(String),

    /// Event payloads must be JSON objects.
    #[error("event payload must be a JSON object")]
    NonObjectPayload,
}

/// A session operation was given invalid input.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A tool definition without a name cannot be registered.
    #[error("missing tool name in definition")]
    MissingToolName,

    /// A tool with this name is already registered.
    #[error("tool {0:?} already added; remove it before adding again")]
    DuplicateTool(String),

    /// No tool with this name is registered.
    #[error("tool {0:?} has not been registered")]
    UnknownTool(String),

    /// The referenced item does not exist.
    #[error("could not find item {0:?}")]
    ItemNotFound(String),

    /// Only message items can be cancelled.
    #[error("item {0:?} is not a message and cannot be cancelled")]
    NotAMessage(String),

    /// Only assistant messages can be cancelled.
    #[error("item {0:?} is not an assistant message and cannot be cancelled")]
    NotAssistant(String),

    /// Cancellation needs an audio content part to truncate.
    #[error("could not find audio content on item {0:?} to cancel")]
    NoAudioContent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_messages() {
        assert_eq!(
            ConnectionError::AlreadyConnected.to_string(),
            "already connected; disconnect first"
        );
        let err = ConnectionError::ConnectFailed {
            url: "wss://example".into(),
            reason: "refused".into(),
        };
        assert!(err.to_string().contains("wss://example"));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn protocol_error_names_the_field() {
        let err = ProtocolError::MissingField { field: "event_id" };
        assert!(err.to_string().contains("event_id"));
    }

    #[test]
    fn validation_error_names_the_tool() {
        let err = ValidationError::DuplicateTool("lookup".into());
        assert!(err.to_string().contains("lookup"));
    }
}
