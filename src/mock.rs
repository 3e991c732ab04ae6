//! In-memory Ensign node for tests.
//!
//! [`MockBroker`] implements every transport trait over tokio channels. Each
//! opened stream is served by its own task, which performs the handshake,
//! answers publishes, forwards delivered events and records everything the
//! client sends. Tests can break or end live streams and control whether the
//! connection comes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use ulid::Ulid;

use crate::retry::{retry_until, RetryPolicy};
use crate::stream::handle::TopicMap;
use crate::stream::proto::{
    Ack, CloseStream, Code, EventPayload, EventWrapper, MimeType, Nack, NackCode, OpenStream,
    PublisherReply, PublisherRequest, Query, StreamReady, SubscribeReply, SubscribeRequest,
    Subscription,
};
use crate::stream::transport::{
    BidiStream, ConnectionObserver, ConnectivityState, PublishClient, PublishStream, QueryClient,
    QueryStream, StreamSink, StreamSource, SubscribeClient, SubscribeStream, TransportError,
    TransportResult,
};

const CHANNEL_SIZE: usize = 64;

type OpenHandler<T> = Arc<dyn Fn(&T) -> TransportResult<()> + Send + Sync>;
type PublishHandler = Arc<dyn Fn(&EventWrapper) -> Option<PublisherReply> + Send + Sync>;
type QueryHandler = Arc<dyn Fn(&Query) -> TransportResult<Vec<EventWrapper>> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
enum Control {
    /// End the stream with an `unavailable` error.
    Disconnect,
    /// End the stream cleanly.
    End,
}

#[derive(Default)]
struct Handlers {
    publish_open: Option<OpenHandler<OpenStream>>,
    subscribe_open: Option<OpenHandler<Subscription>>,
    publish: Option<PublishHandler>,
    query: Option<QueryHandler>,
}

#[derive(Default)]
struct Record {
    opens: Vec<OpenStream>,
    subscriptions: Vec<Subscription>,
    published: Vec<EventWrapper>,
    acks: Vec<Ack>,
    nacks: Vec<Nack>,
    publish_streams: usize,
    subscribe_streams: usize,
}

struct Inner {
    server_id: String,
    state: AtomicU8,
    reconnect: AtomicBool,
    unreachable: AtomicBool,
    topics: Mutex<TopicMap>,
    handlers: Mutex<Handlers>,
    record: Mutex<Record>,
    controls: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    deliveries: Mutex<Vec<mpsc::Sender<EventWrapper>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheaply cloneable handle to an in-memory node.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                server_id: format!("mock-{}", Ulid::new()),
                state: AtomicU8::new(ConnectivityState::Ready.as_u8()),
                reconnect: AtomicBool::new(true),
                unreachable: AtomicBool::new(false),
                topics: Mutex::new(TopicMap::new()),
                handlers: Mutex::new(Handlers::default()),
                record: Mutex::new(Record::default()),
                controls: Mutex::new(Vec::new()),
                deliveries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Registers a topic name returned in every handshake.
    pub fn add_topic(&self, name: impl Into<String>) -> Ulid {
        let topic_id = Ulid::new();
        lock(&self.inner.topics).insert(name.into(), topic_id);
        topic_id
    }

    pub fn topics(&self) -> TopicMap {
        lock(&self.inner.topics).clone()
    }

    /// Decides whether a publish handshake is accepted.
    pub fn on_publish_open<F>(&self, handler: F)
    where
        F: Fn(&OpenStream) -> TransportResult<()> + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).publish_open = Some(Arc::new(handler));
    }

    /// Decides whether a subscription is accepted.
    pub fn on_subscribe_open<F>(&self, handler: F)
    where
        F: Fn(&Subscription) -> TransportResult<()> + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).subscribe_open = Some(Arc::new(handler));
    }

    /// Replaces the default reply to published events. Returning `None`
    /// leaves the event unanswered.
    pub fn on_publish<F>(&self, handler: F)
    where
        F: Fn(&EventWrapper) -> Option<PublisherReply> + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).publish = Some(Arc::new(handler));
    }

    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(&Query) -> TransportResult<Vec<EventWrapper>> + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).query = Some(Arc::new(handler));
    }

    /// Controls whether `wait_for_reconnect` succeeds.
    pub fn set_reconnect(&self, allowed: bool) {
        self.inner.reconnect.store(allowed, Ordering::SeqCst);
    }

    /// While unreachable, opening any stream fails with `unavailable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: ConnectivityState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Breaks every live stream with an `unavailable` error.
    pub fn disconnect(&self) {
        self.set_state(ConnectivityState::TransientFailure);
        self.signal(Control::Disconnect);
    }

    /// Ends every live stream cleanly.
    pub fn end_streams(&self) {
        self.signal(Control::End);
    }

    /// Sends `event` to every live subscription and returns how many took it.
    pub async fn deliver(&self, event: EventWrapper) -> usize {
        let senders: Vec<_> = {
            let mut deliveries = lock(&self.inner.deliveries);
            deliveries.retain(|tx| !tx.is_closed());
            deliveries.clone()
        };

        let mut delivered = 0;
        for tx in senders {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn opens(&self) -> Vec<OpenStream> {
        lock(&self.inner.record).opens.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.inner.record).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<EventWrapper> {
        lock(&self.inner.record).published.clone()
    }

    pub fn acks(&self) -> Vec<Ack> {
        lock(&self.inner.record).acks.clone()
    }

    pub fn nacks(&self) -> Vec<Nack> {
        lock(&self.inner.record).nacks.clone()
    }

    /// Publish streams opened so far, including rejected ones.
    pub fn publish_streams(&self) -> usize {
        lock(&self.inner.record).publish_streams
    }

    pub fn subscribe_streams(&self) -> usize {
        lock(&self.inner.record).subscribe_streams
    }

    fn signal(&self, control: Control) {
        let controls: Vec<_> = lock(&self.inner.controls).drain(..).collect();
        debug!(event = "mock_signal", ?control, streams = controls.len());
        for tx in controls {
            let _ = tx.send(control);
        }
    }

    fn check_reachable(&self) -> TransportResult<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            self.set_state(ConnectivityState::TransientFailure);
            return Err(TransportError::status(Code::Unavailable, "mock node unreachable"));
        }
        Ok(())
    }

    fn open_channels<Req, Rep>(
        &self,
    ) -> (
        BidiStream<Req, Rep>,
        mpsc::Receiver<Req>,
        mpsc::Sender<TransportResult<Rep>>,
        mpsc::UnboundedReceiver<Control>,
    )
    where
        Req: Send + 'static,
        Rep: Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_SIZE);
        let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        lock(&self.inner.controls).push(control_tx);

        let stream = BidiStream::new(
            Box::new(MockSink {
                tx: Mutex::new(Some(request_tx)),
            }),
            Box::new(MockSource { rx: reply_rx }),
        );
        (stream, request_rx, reply_tx, control_rx)
    }
}

impl Inner {
    fn ready(&self, client_id: &str) -> StreamReady {
        let topics = lock(&self.topics)
            .iter()
            .map(|(name, id)| (name.clone(), id.to_string()))
            .collect::<HashMap<_, _>>();
        StreamReady {
            client_id: client_id.to_string(),
            server_id: self.server_id.clone(),
            topics,
        }
    }

    fn publish_reply(&self, event: &EventWrapper) -> Option<PublisherReply> {
        let handler = lock(&self.handlers).publish.clone();
        match handler {
            Some(handler) => handler(event),
            None => self.default_publish_reply(event),
        }
    }

    /// Acks events for known topics and nacks the rest.
    fn default_publish_reply(&self, event: &EventWrapper) -> Option<PublisherReply> {
        let local_id = event.local_id?.to_string();
        let known = {
            let topics = lock(&self.topics);
            topics.is_empty() || topics.values().any(|id| *id == event.topic_id)
        };
        if known {
            Some(PublisherReply::Ack(Ack {
                id: local_id,
                committed: Some(Utc::now()),
            }))
        } else {
            Some(PublisherReply::Nack(Nack {
                id: local_id,
                code: NackCode::TopicUnknown,
                error: Some(format!("topic {} is not known", event.topic_id)),
            }))
        }
    }
}

#[async_trait]
impl ConnectionObserver for MockBroker {
    fn conn_state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    async fn wait_for_reconnect(&self, timeout: Duration) -> bool {
        let policy = RetryPolicy {
            max_attempts: usize::MAX,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            jitter: Duration::ZERO,
        };
        let inner = Arc::clone(&self.inner);
        let ready = retry_until(&policy, timeout, |_| {
            let inner = Arc::clone(&inner);
            async move { inner.reconnect.load(Ordering::SeqCst) }
        })
        .await;
        if ready {
            self.set_state(ConnectivityState::Ready);
        }
        ready
    }
}

#[async_trait]
impl PublishClient for MockBroker {
    async fn publish_stream(&self) -> TransportResult<PublishStream> {
        self.check_reachable()?;
        let (stream, requests, replies, control) = self.open_channels();
        lock(&self.inner.record).publish_streams += 1;
        tokio::spawn(serve_publish(Arc::clone(&self.inner), requests, replies, control));
        Ok(stream)
    }
}

#[async_trait]
impl SubscribeClient for MockBroker {
    async fn subscribe_stream(&self) -> TransportResult<SubscribeStream> {
        self.check_reachable()?;
        let (stream, requests, replies, control) = self.open_channels();
        lock(&self.inner.record).subscribe_streams += 1;
        tokio::spawn(serve_subscribe(Arc::clone(&self.inner), requests, replies, control));
        Ok(stream)
    }
}

#[async_trait]
impl QueryClient for MockBroker {
    async fn query_stream(&self, query: Query) -> TransportResult<QueryStream> {
        self.check_reachable()?;
        let handler = lock(&self.inner.handlers).query.clone();
        let results = match handler {
            Some(handler) => handler(&query)?,
            None => Vec::new(),
        };

        let (reply_tx, reply_rx) = mpsc::channel(results.len().max(1));
        for event in results {
            let _ = reply_tx.try_send(Ok(event));
        }
        drop(reply_tx);

        let (request_tx, _) = mpsc::channel(1);
        Ok(BidiStream::new(
            Box::new(MockSink {
                tx: Mutex::new(Some(request_tx)),
            }),
            Box::new(MockSource { rx: reply_rx }),
        ))
    }
}

async fn finish<T>(replies: &mpsc::Sender<TransportResult<T>>, control: Option<Control>) {
    if let Some(Control::Disconnect) = control {
        let _ = replies
            .send(Err(TransportError::status(
                Code::Unavailable,
                "mock node disconnected",
            )))
            .await;
    }
}

async fn serve_publish(
    inner: Arc<Inner>,
    mut requests: mpsc::Receiver<PublisherRequest>,
    replies: mpsc::Sender<TransportResult<PublisherReply>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let first = tokio::select! {
        request = requests.recv() => request,
        signal = control.recv() => return finish(&replies, signal).await,
    };
    let open = match first {
        Some(PublisherRequest::OpenStream(open)) => open,
        Some(_) => {
            let _ = replies
                .send(Err(TransportError::status(
                    Code::FailedPrecondition,
                    "expected open_stream as the first message",
                )))
                .await;
            return;
        }
        None => return,
    };

    lock(&inner.record).opens.push(open.clone());
    let accept = lock(&inner.handlers).publish_open.clone();
    if let Some(accept) = accept {
        if let Err(err) = accept(&open) {
            let _ = replies.send(Err(err)).await;
            return;
        }
    }
    let ready = inner.ready(&open.client_id);
    let topics = ready.topics.len() as u64;
    if replies.send(Ok(PublisherReply::Ready(ready))).await.is_err() {
        return;
    }

    let mut events = 0;
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(PublisherRequest::Event(event)) => {
                    events += 1;
                    lock(&inner.record).published.push(event.clone());
                    if let Some(reply) = inner.publish_reply(&event) {
                        if replies.send(Ok(reply)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(PublisherRequest::OpenStream(_)) => {
                    let _ = replies
                        .send(Err(TransportError::status(
                            Code::FailedPrecondition,
                            "stream is already open",
                        )))
                        .await;
                    return;
                }
                None => {
                    let stats = CloseStream { events, topics, consumers: 0 };
                    let _ = replies.send(Ok(PublisherReply::CloseStream(stats))).await;
                    return;
                }
            },
            signal = control.recv() => return finish(&replies, signal).await,
        }
    }
}

async fn serve_subscribe(
    inner: Arc<Inner>,
    mut requests: mpsc::Receiver<SubscribeRequest>,
    replies: mpsc::Sender<TransportResult<SubscribeReply>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let first = tokio::select! {
        request = requests.recv() => request,
        signal = control.recv() => return finish(&replies, signal).await,
    };
    let subscription = match first {
        Some(SubscribeRequest::Subscription(subscription)) => subscription,
        Some(_) => {
            let _ = replies
                .send(Err(TransportError::status(
                    Code::FailedPrecondition,
                    "expected subscription as the first message",
                )))
                .await;
            return;
        }
        None => return,
    };

    lock(&inner.record).subscriptions.push(subscription.clone());
    let accept = lock(&inner.handlers).subscribe_open.clone();
    if let Some(accept) = accept {
        if let Err(err) = accept(&subscription) {
            let _ = replies.send(Err(err)).await;
            return;
        }
    }

    let (delivery_tx, mut deliveries) = mpsc::channel(CHANNEL_SIZE);
    lock(&inner.deliveries).push(delivery_tx);
    let ready = inner.ready(&subscription.client_id);
    if replies.send(Ok(SubscribeReply::Ready(ready))).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(SubscribeRequest::Ack(ack)) => {
                    lock(&inner.record).acks.push(ack);
                }
                Some(SubscribeRequest::Nack(nack)) => {
                    lock(&inner.record).nacks.push(nack);
                }
                Some(SubscribeRequest::Subscription(_)) => {
                    let _ = replies
                        .send(Err(TransportError::status(
                            Code::FailedPrecondition,
                            "subscription is already open",
                        )))
                        .await;
                    return;
                }
                None => {
                    let _ = replies.send(Ok(SubscribeReply::CloseStream(CloseStream::default()))).await;
                    return;
                }
            },
            Some(event) = deliveries.recv() => {
                if replies.send(Ok(SubscribeReply::Event(event))).await.is_err() {
                    return;
                }
            }
            signal = control.recv() => return finish(&replies, signal).await,
        }
    }
}

struct MockSink<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
}

#[async_trait]
impl<T: Send + 'static> StreamSink<T> for MockSink<T> {
    async fn send(&self, message: T) -> TransportResult<()> {
        let tx = lock(&self.tx).clone().ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn close_send(&self) -> TransportResult<()> {
        lock(&self.tx).take();
        Ok(())
    }
}

struct MockSource<T> {
    rx: mpsc::Receiver<TransportResult<T>>,
}

#[async_trait]
impl<T: Send + 'static> StreamSource<T> for MockSource<T> {
    async fn recv(&mut self) -> TransportResult<Option<T>> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

/// Plain-text event content created now.
pub fn event_payload(data: impl Into<Vec<u8>>) -> EventPayload {
    EventPayload {
        data: data.into(),
        metadata: HashMap::new(),
        mimetype: MimeType::TextPlain,
        event_type: None,
        created: Utc::now(),
    }
}

/// A committed envelope as a node would deliver it to a subscriber.
pub fn committed_event(topic_id: Ulid, offset: u64, payload: &EventPayload) -> EventWrapper {
    let mut wrapper = EventWrapper {
        id: Ulid::new().to_string(),
        topic_id,
        local_id: None,
        offset,
        epoch: 1,
        committed: Some(Utc::now()),
        event: Vec::new(),
    };
    wrapper.event = serde_json::to_vec(payload).unwrap_or_default();
    wrapper
}
