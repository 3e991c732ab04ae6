//! Event streams.
//!
//! - `proto`: messages exchanged with the Ensign node.
//! - `transport`: stream and connection traits the managers are written against.
//! - `ws`: websocket implementation of those traits.
//! - `publisher` / `subscriber`: long-lived stream managers that survive
//!   reconnects.

/// Event envelope helpers.
pub mod envelope;
/// Shared live-stream slot, handshake and reconnect helpers.
pub mod handle;
/// Stream protocol messages.
pub mod proto;
/// Publish stream manager.
pub mod publisher;
/// Subscribe stream manager.
pub mod subscriber;
pub mod transport;
/// Websocket transport.
pub mod ws;
