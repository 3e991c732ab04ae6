//! Transport boundary used by the stream managers.
//!
//! A bidirectional stream is split into a shareable send half and a receive
//! half owned by exactly one reader. Connection health is exposed through
//! [`ConnectionObserver`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::auth::AuthError;
use crate::stream::proto::{
    Code, EventWrapper, PublisherReply, PublisherRequest, Query, SubscribeReply,
    SubscribeRequest,
};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Server rejected the stream or ended it with an error status.
    #[error("rpc error: {code}: {message}")]
    Status { code: Code, message: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("could not obtain credentials: {0}")]
    Credentials(#[from] AuthError),

    /// Stream or connection is no longer usable for sends.
    #[error("stream is closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Status code carried by a server rejection, if any.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Connection state as reported by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Ready => 2,
            Self::TransientFailure => 3,
            Self::Shutdown => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::TransientFailure,
            4 => Self::Shutdown,
            _ => Self::Idle,
        }
    }
}

#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    fn conn_state(&self) -> ConnectivityState;

    /// Waits until the connection is ready again; `false` when `timeout`
    /// elapses first.
    async fn wait_for_reconnect(&self, timeout: Duration) -> bool;
}

/// Send half of a stream. Implementations serialize concurrent sends.
#[async_trait]
pub trait StreamSink<T: Send + 'static>: Send + Sync {
    async fn send(&self, message: T) -> TransportResult<()>;

    /// Half-closes the stream; the server is expected to finish and end it.
    async fn close_send(&self) -> TransportResult<()>;
}

/// Receive half of a stream.
#[async_trait]
pub trait StreamSource<T: Send + 'static>: Send {
    /// Next server message; `Ok(None)` on clean end-of-stream.
    async fn recv(&mut self) -> TransportResult<Option<T>>;
}

pub struct BidiStream<Req: Send + 'static, Rep: Send + 'static> {
    pub sink: Box<dyn StreamSink<Req>>,
    pub source: Box<dyn StreamSource<Rep>>,
}

impl<Req: Send + 'static, Rep: Send + 'static> BidiStream<Req, Rep> {
    pub fn new(sink: Box<dyn StreamSink<Req>>, source: Box<dyn StreamSource<Rep>>) -> Self {
        Self { sink, source }
    }
}

pub type PublishStream = BidiStream<PublisherRequest, PublisherReply>;
pub type SubscribeStream = BidiStream<SubscribeRequest, SubscribeReply>;
pub type QueryStream = BidiStream<Query, EventWrapper>;

#[async_trait]
pub trait PublishClient: ConnectionObserver {
    async fn publish_stream(&self) -> TransportResult<PublishStream>;
}

#[async_trait]
pub trait SubscribeClient: ConnectionObserver {
    async fn subscribe_stream(&self) -> TransportResult<SubscribeStream>;
}

#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Opens a result stream for `query`; the query has already been sent.
    async fn query_stream(&self, query: Query) -> TransportResult<QueryStream>;
}

/// Everything the client facade needs from a transport.
pub trait Transport: PublishClient + SubscribeClient + QueryClient {}

impl<T> Transport for T where T: PublishClient + SubscribeClient + QueryClient {}
