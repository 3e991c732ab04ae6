//! Websocket transport for the publish, subscribe and query streams.
//!
//! Each stream is its own websocket connection carrying one JSON message per
//! text frame. The server ends a stream with a normal close, or with a
//! [`StatusFrame`] or non-normal close code when it rejects it.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::auth::AuthClient;
use crate::config::Options;
use crate::retry::{retry_until, with_timeout, RetryPolicy};
use crate::stream::proto::{Code, Query, StatusFrame};
use crate::stream::transport::{
    BidiStream, ConnectionObserver, ConnectivityState, PublishClient, PublishStream, QueryClient,
    QueryStream, StreamSink, StreamSource, SubscribeClient, SubscribeStream, TransportError,
    TransportResult,
};

pub const PUBLISH_PATH: &str = "/v1/publish";
pub const SUBSCRIBE_PATH: &str = "/v1/subscribe";
pub const QUERY_PATH: &str = "/v1/ensql";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsInner {
    base_url: Url,
    auth: Option<Arc<AuthClient>>,
    state: AtomicU8,
    probe_policy: RetryPolicy,
}

impl WsInner {
    fn set_state(&self, state: ConnectivityState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Opens streams against an Ensign node over websockets.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    /// `base_url` is the node's `ws://` or `wss://` root. With `auth`, every
    /// stream is opened with a bearer token.
    pub fn new(base_url: &str, auth: Option<Arc<AuthClient>>) -> TransportResult<Self> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| TransportError::InvalidEndpoint(format!("{base_url}: {err}")))?;
        if !matches!(base_url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "{base_url}: scheme must be ws or wss"
            )));
        }
        if base_url.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint(format!(
                "{base_url}: missing host"
            )));
        }

        Ok(Self {
            inner: Arc::new(WsInner {
                base_url,
                auth,
                state: AtomicU8::new(ConnectivityState::Idle.as_u8()),
                probe_policy: RetryPolicy::reconnect(),
            }),
        })
    }

    pub fn from_options(options: &Options, auth: Option<Arc<AuthClient>>) -> TransportResult<Self> {
        Self::new(&options.ws_base_url(), auth)
    }

    pub fn base_url(&self) -> &str {
        self.inner.base_url.as_str()
    }

    fn endpoint(&self, path: &str) -> TransportResult<Url> {
        self.inner
            .base_url
            .join(path)
            .map_err(|err| TransportError::InvalidEndpoint(format!("{path}: {err}")))
    }

    async fn connect<Req, Rep>(&self, path: &str) -> TransportResult<BidiStream<Req, Rep>>
    where
        Req: Serialize + Send + 'static,
        Rep: DeserializeOwned + Send + 'static,
    {
        let url = self.endpoint(path)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(auth) = &self.inner.auth {
            let bearer = auth.bearer().await?;
            request
                .headers_mut()
                .insert("authorization", bearer.parse()?);
        }

        self.inner.set_state(ConnectivityState::Connecting);
        let socket = match connect_async(request).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                self.inner.set_state(ConnectivityState::TransientFailure);
                debug!(event = "ws_connect_failed", url = %url, error = %err);
                return Err(err.into());
            }
        };
        self.inner.set_state(ConnectivityState::Ready);
        debug!(event = "ws_connected", url = %url);

        let (sink, source) = socket.split();
        Ok(BidiStream::new(
            Box::new(WsSink {
                sink: Mutex::new(sink),
                _message: PhantomData,
            }),
            Box::new(WsSource {
                source,
                inner: Arc::clone(&self.inner),
                _message: PhantomData,
            }),
        ))
    }

    async fn probe(&self) -> bool {
        let host = self.inner.base_url.host_str().unwrap_or_default().to_string();
        let port = self.inner.base_url.port_or_known_default().unwrap_or(443);
        matches!(
            with_timeout(PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl ConnectionObserver for WsTransport {
    fn conn_state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Probes the node with plain TCP connects until one succeeds.
    async fn wait_for_reconnect(&self, timeout: Duration) -> bool {
        self.inner.set_state(ConnectivityState::Connecting);
        let reachable = retry_until(&self.inner.probe_policy, timeout, |_| self.probe()).await;
        let state = if reachable {
            ConnectivityState::Ready
        } else {
            ConnectivityState::TransientFailure
        };
        self.inner.set_state(state);
        reachable
    }
}

#[async_trait]
impl PublishClient for WsTransport {
    async fn publish_stream(&self) -> TransportResult<PublishStream> {
        self.connect(PUBLISH_PATH).await
    }
}

#[async_trait]
impl SubscribeClient for WsTransport {
    async fn subscribe_stream(&self) -> TransportResult<SubscribeStream> {
        self.connect(SUBSCRIBE_PATH).await
    }
}

#[async_trait]
impl QueryClient for WsTransport {
    async fn query_stream(&self, query: Query) -> TransportResult<QueryStream> {
        let stream: QueryStream = self.connect(QUERY_PATH).await?;
        stream.sink.send(query).await?;
        Ok(stream)
    }
}

struct WsSink<Req> {
    sink: Mutex<SplitSink<Socket, Message>>,
    _message: PhantomData<fn(Req)>,
}

#[async_trait]
impl<Req> StreamSink<Req> for WsSink<Req>
where
    Req: Serialize + Send + 'static,
{
    async fn send(&self, message: Req) -> TransportResult<()> {
        let text = serde_json::to_string(&message)?;
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Sends a normal close; the server finishes and closes its side.
    async fn close_send(&self) -> TransportResult<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed)
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

struct WsSource<Rep> {
    source: SplitStream<Socket>,
    inner: Arc<WsInner>,
    _message: PhantomData<fn() -> Rep>,
}

#[async_trait]
impl<Rep> StreamSource<Rep> for WsSource<Rep>
where
    Rep: DeserializeOwned + Send + 'static,
{
    async fn recv(&mut self) -> TransportResult<Option<Rep>> {
        loop {
            let result = match self.source.next().await {
                Some(Ok(Message::Text(text))) => parse_reply(&text).map(Some),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(_))) => Err(TransportError::Protocol(
                    "unexpected binary frame".to_string(),
                )),
                Some(Ok(Message::Close(frame))) => close_result(frame),
                Some(Err(err)) => Err(err.into()),
                None => Err(TransportError::Closed),
            };
            if let Err(err) = &result {
                if !matches!(err, TransportError::Json(_) | TransportError::Protocol(_)) {
                    self.inner.set_state(ConnectivityState::TransientFailure);
                }
            }
            return result;
        }
    }
}

fn parse_reply<Rep: DeserializeOwned>(text: &str) -> TransportResult<Rep> {
    if let Ok(frame) = StatusFrame::from_text(text) {
        return Err(TransportError::status(frame.status, frame.message));
    }
    Ok(serde_json::from_str(text)?)
}

/// Normal closes end the stream; anything else is a server error.
fn close_result<Rep>(frame: Option<CloseFrame<'static>>) -> TransportResult<Option<Rep>> {
    let Some(frame) = frame else {
        return Ok(None);
    };
    let code = match frame.code {
        CloseCode::Normal => return Ok(None),
        CloseCode::Away | CloseCode::Again | CloseCode::Restart => Code::Unavailable,
        CloseCode::Policy => Code::PermissionDenied,
        CloseCode::Size => Code::ResourceExhausted,
        CloseCode::Error => Code::Internal,
        _ => Code::Unknown,
    };
    Err(TransportError::status(code, frame.reason.into_owned()))
}
