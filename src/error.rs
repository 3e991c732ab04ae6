//! Crate-level error returned by the client facade and events.

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::stream::envelope::EnvelopeError;
use crate::stream::handle::StreamError;
use crate::stream::proto::Nack;
use crate::stream::transport::TransportError;
use crate::topics::TopicsError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Topics(#[from] TopicsError),

    /// Only events received on a subscription can be acked or nacked.
    #[error("cannot ack or nack an event not received from a subscription")]
    CannotAck,

    #[error("event has not been published")]
    NotPublished,

    #[error("event has already been published; publish a duplicate instead")]
    AlreadyPublished,

    /// The publisher dropped the reply, e.g. because the stream broke or the
    /// publisher was closed before the server answered.
    #[error("publish reply abandoned before the server answered")]
    ReplyAbandoned,

    #[error("server rejected event: {}", .0.code)]
    Rejected(Nack),

    #[error("unhandled publisher reply: {0}")]
    UnhandledReply(String),

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("query cursor is closed")]
    CursorClosed,
}
