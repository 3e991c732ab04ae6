//! Publish stream manager.
//!
//! A [`Publisher`] keeps one publish stream open to an Ensign node. Each
//! published event gets a fresh local id which is registered in a pending
//! map before the event is sent; the receive loop matches acks and nacks back
//! to the caller's reply channel by that id. When the stream breaks, the
//! lifecycle task waits for the connection to return, repeats the handshake
//! and swaps the new stream in. Replies still pending on the old stream are
//! abandoned, which closes their channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::{Generator, Ulid};

use crate::config::StreamOptions;
use crate::retry::with_timeout;
use crate::stream::handle::{
    handshake, resolve_topic, wait_for_reconnect, FatalSlot, LiveStream, StreamDown,
    StreamError, StreamHandle, TopicMap,
};
use crate::stream::proto::{EventPayload, EventWrapper, OpenStream, PublisherReply, PublisherRequest};
use crate::stream::transport::{PublishClient, StreamSource};

type ReplySource = Box<dyn StreamSource<PublisherReply>>;

struct PendingReply {
    generation: u64,
    reply: oneshot::Sender<PublisherReply>,
}

struct Shared {
    client: Arc<dyn PublishClient>,
    client_id: String,
    options: StreamOptions,
    stream: StreamHandle<PublisherRequest>,
    pending: Mutex<HashMap<Ulid, PendingReply>>,
    ids: Mutex<Generator>,
    fatal: FatalSlot,
    closed: AtomicBool,
}

/// Maintains an open publish stream and correlates replies.
pub struct Publisher {
    shared: Arc<Shared>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    lifecycle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Opens a publish stream with default options.
    ///
    /// Fails if the stream cannot be opened or the server rejects the
    /// handshake.
    pub async fn new(client: Arc<dyn PublishClient>) -> Result<Self, StreamError> {
        Self::with_options(client, StreamOptions::default()).await
    }

    pub async fn with_options(
        client: Arc<dyn PublishClient>,
        options: StreamOptions,
    ) -> Result<Self, StreamError> {
        let client_id = Ulid::new().to_string();
        let (live, source) = open_stream(client.as_ref(), &client_id, &options).await?;
        info!(
            event = "publish_stream_opened",
            client_id = %client_id,
            server_id = %live.server_id,
            topics = live.topics.len()
        );

        let shared = Arc::new(Shared {
            client,
            client_id,
            options,
            stream: StreamHandle::new(live),
            pending: Mutex::new(HashMap::new()),
            ids: Mutex::new(Generator::new()),
            fatal: FatalSlot::default(),
            closed: AtomicBool::new(false),
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let lifecycle = tokio::spawn(run_lifecycle(Arc::clone(&shared), source, stop_rx));

        Ok(Self {
            shared,
            stop: Mutex::new(Some(stop_tx)),
            lifecycle: tokio::sync::Mutex::new(Some(lifecycle)),
        })
    }

    /// Publishes `event` to `topic` (a topic id or a name from the handshake).
    ///
    /// The returned channel yields exactly one ack or nack, or closes without
    /// a value if the reply is abandoned because the stream went away.
    pub async fn publish(
        &self,
        topic: &str,
        event: &EventPayload,
    ) -> Result<oneshot::Receiver<PublisherReply>, StreamError> {
        let (_, reply) = self.publish_envelope(topic, event).await?;
        Ok(reply)
    }

    /// Like [`Publisher::publish`], also returning the envelope that was sent.
    pub async fn publish_envelope(
        &self,
        topic: &str,
        event: &EventPayload,
    ) -> Result<(EventWrapper, oneshot::Receiver<PublisherReply>), StreamError> {
        self.shared.check_usable()?;

        let guard = self.shared.stream.read().await;
        let live = guard.as_ref().ok_or(StreamError::NotOpen)?;
        let topic_id = resolve_topic(topic, &live.topics)?;

        let local_id = self.shared.next_id();
        let envelope = EventWrapper::wrap(topic_id, Some(local_id), event)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending().insert(
            local_id,
            PendingReply {
                generation: live.generation,
                reply: reply_tx,
            },
        );

        if let Err(err) = live.sink.send(PublisherRequest::Event(envelope.clone())).await {
            self.shared.pending().remove(&local_id);
            debug!(event = "publish_send_failed", local_id = %local_id, error = %err);
            return Err(err.into());
        }

        Ok((envelope, reply_rx))
    }

    /// Stops reconnecting, half-closes the stream and waits for the
    /// background tasks. Pending replies are abandoned.
    pub async fn close(&self) -> Result<(), StreamError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        let close_result = self.shared.stream.close_send().await;

        let lifecycle = self.lifecycle.lock().await.take();
        if let Some(lifecycle) = lifecycle {
            let _ = lifecycle.await;
        }
        self.shared.abandon_pending(None, "close");

        debug!(event = "publish_stream_closed", client_id = %self.shared.client_id);
        close_result
    }

    /// Fatal error that stopped this publisher, if any.
    pub fn err(&self) -> Option<Arc<StreamError>> {
        self.shared.fatal.get()
    }

    /// Whether new publishes can still be sent. False once the publisher is
    /// closed, has failed, or the node ended the stream.
    pub async fn is_open(&self) -> bool {
        self.shared.check_usable().is_ok() && self.shared.stream.is_live().await
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Topic names allowed on the current stream.
    pub async fn topics(&self) -> Arc<TopicMap> {
        self.shared.stream.topics().await
    }

    pub async fn server_id(&self) -> Option<String> {
        self.shared.stream.server_id().await
    }

    /// Number of published events still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.pending().len()
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<Ulid, PendingReply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> Ulid {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.generate().unwrap_or_else(|_| Ulid::new())
    }

    fn check_usable(&self) -> Result<(), StreamError> {
        self.fatal.check()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Hands `reply` to whoever is waiting on `id`.
    fn correlate(&self, id: &str, reply: PublisherReply) -> Result<(), StreamError> {
        let local_id =
            Ulid::from_string(id).map_err(|_| StreamError::MalformedId(id.to_string()))?;

        let waiting = self.pending().remove(&local_id);
        match waiting {
            Some(waiting) => {
                let _ = waiting.reply.send(reply);
            }
            None => debug!(event = "publish_reply_uncorrelated", local_id = %local_id),
        }
        Ok(())
    }

    /// Drops pending replies registered before generation `before`, or all
    /// of them when `before` is `None`.
    fn abandon_pending(&self, before: Option<u64>, reason: &'static str) {
        let abandoned = {
            let mut pending = self.pending();
            let count = pending.len();
            match before {
                Some(generation) => pending.retain(|_, waiting| waiting.generation >= generation),
                None => pending.clear(),
            }
            count - pending.len()
        };
        if abandoned > 0 {
            debug!(event = "publish_replies_abandoned", count = abandoned, reason);
        }
    }

    async fn repair(&self) -> Result<ReplySource, StreamError> {
        wait_for_reconnect(self.client.as_ref(), self.options.reconnect_timeout).await?;

        let (live, source) = open_stream(self.client.as_ref(), &self.client_id, &self.options).await?;
        let server_id = live.server_id.clone();
        let generation = self.stream.replace(live).await;
        self.abandon_pending(Some(generation), "reconnect");

        info!(
            event = "publish_stream_reconnected",
            client_id = %self.client_id,
            server_id = %server_id,
            generation
        );
        Ok(source)
    }
}

async fn open_stream(
    client: &dyn PublishClient,
    client_id: &str,
    options: &StreamOptions,
) -> Result<(LiveStream<PublisherRequest>, ReplySource), StreamError> {
    let stream = with_timeout(options.handshake_timeout, client.publish_stream())
        .await
        .map_err(|_| StreamError::HandshakeTimeout)??;

    let open = PublisherRequest::OpenStream(OpenStream {
        client_id: client_id.to_string(),
        topics: Vec::new(),
    });
    let (live, source, _) = handshake(
        stream,
        open,
        |reply| match reply {
            PublisherReply::Ready(ready) => Some(ready),
            _ => None,
        },
        options.handshake_timeout,
    )
    .await?;
    Ok((live, source))
}

async fn run_lifecycle(
    shared: Arc<Shared>,
    mut source: ReplySource,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let (down_tx, mut down_rx) = mpsc::channel(1);
        let receiver = tokio::spawn(run_receiver(Arc::clone(&shared), source, down_tx));

        let signal = tokio::select! {
            _ = &mut stop => {
                stop_receiver(&shared, receiver).await;
                return;
            }
            signal = down_rx.recv() => signal,
        };

        match signal {
            None => {
                shared.stream.clear().await;
                shared.abandon_pending(None, "end_of_stream");
                let _ = stop.await;
                return;
            }
            Some(StreamDown::Fatal(err)) => {
                shared.fatal.set(err);
                shared.stream.clear().await;
                shared.abandon_pending(None, "fatal");
                return;
            }
            Some(StreamDown::Disconnected(err)) => {
                warn!(
                    event = "publish_stream_down",
                    client_id = %shared.client_id,
                    error = %err
                );
                shared.abandon_pending(None, "disconnected");

                let repaired = tokio::select! {
                    _ = &mut stop => return,
                    repaired = shared.repair() => repaired,
                };
                match repaired {
                    Ok(next) => source = next,
                    Err(err) => {
                        shared.fatal.set(err);
                        shared.abandon_pending(None, "fatal");
                        return;
                    }
                }
            }
        }
    }
}

async fn stop_receiver(shared: &Shared, mut receiver: JoinHandle<()>) {
    if with_timeout(shared.options.close_timeout, &mut receiver)
        .await
        .is_err()
    {
        warn!(event = "publish_receiver_aborted", client_id = %shared.client_id);
        receiver.abort();
    }
    shared.stream.clear().await;
}

async fn run_receiver(shared: Arc<Shared>, mut source: ReplySource, down: mpsc::Sender<StreamDown>) {
    loop {
        let reply = match source.recv().await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                debug!(event = "publish_stream_eof", client_id = %shared.client_id);
                return;
            }
            Err(err) => {
                debug!(event = "publish_stream_recv_failed", error = %err);
                let _ = down.try_send(StreamDown::Disconnected(err));
                return;
            }
        };

        let correlated = match &reply {
            PublisherReply::Ack(ack) => {
                let id = ack.id.clone();
                shared.correlate(&id, reply)
            }
            PublisherReply::Nack(nack) => {
                let id = nack.id.clone();
                shared.correlate(&id, reply)
            }
            PublisherReply::CloseStream(stats) => {
                debug!(
                    event = "publish_stream_closed_by_server",
                    events = stats.events,
                    topics = stats.topics,
                    consumers = stats.consumers
                );
                Ok(())
            }
            PublisherReply::Ready(_) => {
                debug!(event = "publish_stream_unexpected_reply", kind = "ready");
                Ok(())
            }
        };

        if let Err(err) = correlated {
            let _ = down.try_send(StreamDown::Fatal(err));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;
    use ulid::Ulid;

    use super::Publisher;
    use crate::config::StreamOptions;
    use crate::mock::{event_payload, MockBroker};
    use crate::stream::handle::StreamError;
    use crate::stream::proto::{Ack, Code, Nack, NackCode, PublisherReply};
    use crate::stream::transport::TransportError;

    fn fast_options() -> StreamOptions {
        StreamOptions {
            handshake_timeout: Duration::from_secs(2),
            reconnect_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(200),
            buffer_size: 8,
        }
    }

    async fn publisher(broker: &MockBroker) -> Publisher {
        Publisher::with_options(Arc::new(broker.clone()), fast_options())
            .await
            .expect("open publisher")
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn publishes_by_name_and_receives_ack() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let publisher = publisher(&broker).await;

        let reply = publisher
            .publish("orders", &event_payload("hello"))
            .await
            .expect("publish");
        let reply = timeout(Duration::from_secs(1), reply)
            .await
            .expect("reply in time")
            .expect("reply delivered");

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic_id, topic_id);
        match reply {
            PublisherReply::Ack(ack) => {
                assert_eq!(Some(ack.id), published[0].local_id.map(|id| id.to_string()));
                assert!(ack.committed.is_some());
            }
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(publisher.pending(), 0);
        assert_eq!(publisher.server_id().await.as_deref(), Some(broker.server_id()));

        publisher.close().await.expect("close");
    }

    #[tokio::test]
    async fn unknown_topic_name_fails_without_sending() {
        let broker = MockBroker::new();
        broker.add_topic("orders");
        let publisher = publisher(&broker).await;

        let err = publisher
            .publish("shipments", &event_payload("x"))
            .await
            .expect_err("unresolvable topic");
        assert!(matches!(err, StreamError::ResolveTopic(ref name) if name == "shipments"));
        assert!(broker.published().is_empty());
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn topic_ids_bypass_the_topic_map() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;
        let topic_id = Ulid::new();

        let reply = publisher
            .publish(&topic_id.to_string(), &event_payload("x"))
            .await
            .expect("publish by id");
        assert!(matches!(reply.await, Ok(PublisherReply::Ack(_))));
        assert_eq!(broker.published()[0].topic_id, topic_id);
    }

    #[tokio::test]
    async fn nacks_reach_the_caller() {
        let broker = MockBroker::new();
        broker.on_publish(|event| {
            Some(PublisherReply::Nack(Nack {
                id: event.local_id.map(|id| id.to_string()).unwrap_or_default(),
                code: NackCode::UnknownType,
                error: Some("schema mismatch".to_string()),
            }))
        });
        let publisher = publisher(&broker).await;

        let reply = publisher
            .publish(&Ulid::new().to_string(), &event_payload("x"))
            .await
            .expect("publish");
        match reply.await.expect("reply") {
            PublisherReply::Nack(nack) => assert_eq!(nack.code, NackCode::UnknownType),
            other => panic!("expected nack, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_get_unique_correlations() {
        let broker = MockBroker::new();
        broker.add_topic("orders");
        let publisher = Arc::new(publisher(&broker).await);

        let mut tasks = Vec::new();
        for n in 0..50 {
            let publisher = Arc::clone(&publisher);
            tasks.push(tokio::spawn(async move {
                let reply = publisher
                    .publish("orders", &event_payload(format!("event-{n}")))
                    .await
                    .expect("publish");
                match reply.await.expect("reply") {
                    PublisherReply::Ack(ack) => ack.id,
                    other => panic!("expected ack, got {other:?}"),
                }
            }));
        }

        let mut acked = HashSet::new();
        for task in tasks {
            assert!(acked.insert(task.await.expect("task")), "duplicate ack id");
        }
        assert_eq!(acked.len(), 50);

        let sent: HashSet<_> = broker
            .published()
            .iter()
            .filter_map(|event| event.local_id.map(|id| id.to_string()))
            .collect();
        assert_eq!(sent, acked);
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn rejected_handshake_fails_construction() {
        let broker = MockBroker::new();
        broker.on_publish_open(|_| {
            Err(TransportError::status(Code::PermissionDenied, "publish not allowed"))
        });

        let err = Publisher::with_options(Arc::new(broker.clone()), fast_options())
            .await
            .err()
            .expect("handshake rejected");
        match err {
            StreamError::Transport(err) => assert_eq!(err.code(), Some(Code::PermissionDenied)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.publish_streams(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_fails_construction() {
        let broker = MockBroker::new();
        broker.set_unreachable(true);
        let err = Publisher::with_options(Arc::new(broker), fast_options())
            .await
            .err()
            .expect("unreachable");
        assert!(matches!(err, StreamError::Transport(_)));
    }

    #[tokio::test]
    async fn reconnects_transparently_after_disconnect() {
        let broker = MockBroker::new();
        broker.add_topic("orders");
        let publisher = publisher(&broker).await;
        let client_id = publisher.client_id().to_string();

        let first = publisher.publish("orders", &event_payload("before")).await.expect("publish");
        assert!(matches!(first.await, Ok(PublisherReply::Ack(_))));

        broker.disconnect();
        wait_until(|| broker.publish_streams() == 2).await;

        let reply = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(reply) = publisher.publish("orders", &event_payload("after")).await {
                    if let Ok(reply) = reply.await {
                        return reply;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("publish after reconnect");
        assert!(matches!(reply, PublisherReply::Ack(_)));
        assert!(publisher.err().is_none());

        let opens = broker.opens();
        assert_eq!(opens.len(), 2);
        assert!(opens.iter().all(|open| open.client_id == client_id));
    }

    #[tokio::test]
    async fn pending_replies_are_abandoned_when_stream_breaks() {
        let broker = MockBroker::new();
        broker.on_publish(|_| None);
        let publisher = publisher(&broker).await;

        let reply = publisher
            .publish(&Ulid::new().to_string(), &event_payload("lost"))
            .await
            .expect("publish");
        assert_eq!(publisher.pending(), 1);

        broker.disconnect();
        let outcome = timeout(Duration::from_secs(1), reply).await.expect("closed in time");
        assert!(outcome.is_err(), "reply channel must close without a value");
        wait_until(|| publisher.pending() == 0).await;
    }

    #[tokio::test]
    async fn failed_reconnect_is_fatal() {
        let broker = MockBroker::new();
        broker.set_reconnect(false);
        let publisher = publisher(&broker).await;

        broker.disconnect();
        wait_until(|| publisher.err().is_some()).await;
        assert!(matches!(*publisher.err().expect("fatal"), StreamError::Reconnect));

        let err = publisher
            .publish(&Ulid::new().to_string(), &event_payload("x"))
            .await
            .expect_err("fatal publisher");
        assert!(err.is_fatal());
        assert_eq!(broker.publish_streams(), 1);
    }

    #[tokio::test]
    async fn rejected_rehandshake_is_fatal() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;

        broker.on_publish_open(|_| Err(TransportError::status(Code::Unauthenticated, "expired")));
        broker.disconnect();
        wait_until(|| publisher.err().is_some()).await;
        assert!(matches!(*publisher.err().expect("fatal"), StreamError::Transport(_)));
    }

    #[tokio::test]
    async fn malformed_reply_id_is_fatal() {
        let broker = MockBroker::new();
        broker.on_publish(|_| {
            Some(PublisherReply::Ack(Ack {
                id: "definitely-not-a-ulid".to_string(),
                committed: None,
            }))
        });
        let publisher = publisher(&broker).await;

        let reply = publisher
            .publish(&Ulid::new().to_string(), &event_payload("x"))
            .await
            .expect("publish");
        assert!(reply.await.is_err());
        wait_until(|| publisher.err().is_some()).await;
        assert!(matches!(
            *publisher.err().expect("fatal"),
            StreamError::MalformedId(_)
        ));
    }

    #[tokio::test]
    async fn end_of_stream_closes_quietly() {
        let broker = MockBroker::new();
        broker.on_publish(|_| None);
        let publisher = publisher(&broker).await;
        let reply = publisher
            .publish(&Ulid::new().to_string(), &event_payload("x"))
            .await
            .expect("publish");

        broker.end_streams();
        assert!(timeout(Duration::from_secs(1), reply).await.expect("in time").is_err());

        let err = publisher
            .publish(&Ulid::new().to_string(), &event_payload("y"))
            .await
            .expect_err("stream ended");
        assert!(matches!(err, StreamError::NotOpen));
        assert!(publisher.err().is_none());
        assert!(!publisher.is_open().await);
        assert_eq!(broker.publish_streams(), 1);
        publisher.close().await.expect("close");
    }

    #[tokio::test]
    async fn close_abandons_pending_and_rejects_new_publishes() {
        let broker = MockBroker::new();
        broker.on_publish(|_| None);
        let publisher = publisher(&broker).await;

        let reply = publisher
            .publish(&Ulid::new().to_string(), &event_payload("x"))
            .await
            .expect("publish");
        assert!(publisher.is_open().await);
        publisher.close().await.expect("close");
        assert!(reply.await.is_err());
        assert_eq!(publisher.pending(), 0);
        assert!(!publisher.is_open().await);

        let err = publisher
            .publish(&Ulid::new().to_string(), &event_payload("y"))
            .await
            .expect_err("closed");
        assert!(matches!(err, StreamError::Closed));
        publisher.close().await.expect("second close is a no-op");
    }
}
