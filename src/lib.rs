//! Rust SDK for the Ensign eventing platform.
//!
//! The crate is organized by concern:
//! - `client`: [`Client`] facade for publishing, subscribing, queries and topics.
//! - `stream`: publish and subscribe stream managers over a pluggable transport.
//! - `event`: application events and their ack/nack lifecycle.
//! - `auth` and `topics`: REST clients for credentials and topic management.
//! - `retry`: shared retry and timeout utilities.

/// Access and refresh token management.
pub mod auth;
/// Client facade.
pub mod client;
/// Options, environment loading and validation.
pub mod config;
/// Crate-wide error type.
pub mod error;
/// Application events and acknowledgement state.
pub mod event;
/// In-memory node implementing the transport traits, for tests.
pub mod mock;
/// Read-only query cursor.
pub mod query;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Stream managers, wire protocol and transports.
pub mod stream;
/// Consumer handle over a subscribe stream.
pub mod subscription;
/// Topic management REST client and name cache.
pub mod topics;

pub use client::Client;
pub use config::{Options, StreamOptions};
pub use error::{Error, Result};
pub use event::{Event, Metadata};
pub use query::QueryCursor;
pub use subscription::Subscription;
