//! # sona-relay
//!
//! The gateway: accepts downstream WebSocket connections, opens one
//! upstream realtime session per connection with a gateway-held credential
//! (never exposed downstream), and relays a filtered event surface in both
//! directions.
//!
//! Downstream-origin envelopes go upstream verbatim. Upstream-origin
//! traffic reaches downstream two ways: a best-effort raw mirror of every
//! inbound frame, and the wrapped `realtime.event` / `conversation.updated`
//! notifications — the former filtered by a fixed allow-list, an
//! intentional reduction of the protocol surface. Closure on either side
//! closes the other; no reconnection is attempted.

#![deny(unsafe_code)]

mod relay;

pub use relay::{Relay, RelayConfig, RelayError, is_relayed_event};
