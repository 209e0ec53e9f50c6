//! # sona-core
//!
//! Foundation crate for the sona realtime relay.
//!
//! Provides the shared vocabulary the other sona crates depend on:
//!
//! - **Ids**: [`ids::generate_id`] — prefixed, base58-flavored event/item ids
//! - **Audio**: [`audio`] — base64 transport encoding and PCM helpers for
//!   16-bit little-endian mono audio at 24 kHz
//! - **Errors**: [`errors::ConnectionError`], [`errors::ProtocolError`],
//!   [`errors::ValidationError`] via `thiserror`
//! - **Logging**: [`logging::init`] — tracing subscriber bootstrap
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other sona crates.

#![deny(unsafe_code)]

pub mod audio;
pub mod errors;
pub mod ids;
pub mod logging;
