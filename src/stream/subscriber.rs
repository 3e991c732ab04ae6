//! Subscribe stream manager.
//!
//! A [`Subscriber`] sends one subscription and forwards every delivered
//! event into a bounded channel. A full channel blocks the receive loop, so a
//! slow consumer slows the stream down instead of losing events. Broken
//! streams are repaired with the same subscription; acks and nacks go out on
//! whichever stream is current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::StreamOptions;
use crate::retry::with_timeout;
use crate::stream::handle::{
    handshake, wait_for_reconnect, FatalSlot, LiveStream, StreamDown, StreamError, StreamHandle,
    TopicMap,
};
use crate::stream::proto::{
    Ack, EventWrapper, Nack, SubscribeReply, SubscribeRequest, Subscription,
};
use crate::stream::transport::{StreamSource, SubscribeClient};

type EventSource = Box<dyn StreamSource<SubscribeReply>>;

/// Sends acknowledgements for received events back to the server.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, ack: Ack) -> Result<(), StreamError>;
    async fn nack(&self, nack: Nack) -> Result<(), StreamError>;
}

struct Shared {
    client: Arc<dyn SubscribeClient>,
    subscription: Subscription,
    options: StreamOptions,
    stream: StreamHandle<SubscribeRequest>,
    fatal: FatalSlot,
    closed: AtomicBool,
}

/// Maintains an open subscription and delivers its events.
pub struct Subscriber {
    shared: Arc<Shared>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    lifecycle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Subscribes to `topics` with default options.
    ///
    /// Returns the event channel together with the manager. The channel
    /// closes once the subscriber is closed or fails permanently.
    pub async fn new(
        client: Arc<dyn SubscribeClient>,
        topics: Vec<String>,
    ) -> Result<(mpsc::Receiver<EventWrapper>, Self), StreamError> {
        Self::with_options(client, topics, StreamOptions::default()).await
    }

    pub async fn with_options(
        client: Arc<dyn SubscribeClient>,
        topics: Vec<String>,
        options: StreamOptions,
    ) -> Result<(mpsc::Receiver<EventWrapper>, Self), StreamError> {
        let subscription = Subscription {
            client_id: Ulid::new().to_string(),
            topics,
        };
        let (live, source) = open_stream(client.as_ref(), &subscription, &options).await?;
        info!(
            event = "subscribe_stream_opened",
            client_id = %subscription.client_id,
            server_id = %live.server_id,
            topics = subscription.topics.len()
        );

        let (events_tx, events_rx) = mpsc::channel(options.buffer_size.max(1));
        let shared = Arc::new(Shared {
            client,
            subscription,
            options,
            stream: StreamHandle::new(live),
            fatal: FatalSlot::default(),
            closed: AtomicBool::new(false),
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let lifecycle = tokio::spawn(run_lifecycle(Arc::clone(&shared), source, events_tx, stop_rx));

        Ok((
            events_rx,
            Self {
                shared,
                stop: Mutex::new(Some(stop_tx)),
                lifecycle: tokio::sync::Mutex::new(Some(lifecycle)),
            },
        ))
    }

    /// Sends an ack on the current stream.
    pub async fn ack(&self, ack: Ack) -> Result<(), StreamError> {
        self.send(SubscribeRequest::Ack(ack)).await
    }

    /// Sends a nack on the current stream.
    pub async fn nack(&self, nack: Nack) -> Result<(), StreamError> {
        self.send(SubscribeRequest::Nack(nack)).await
    }

    /// Stops reconnecting, half-closes the stream and waits for the
    /// background tasks. The event channel closes afterwards.
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

        debug!(
            event = "subscribe_stream_closed",
            client_id = %self.shared.subscription.client_id
        );
        close_result
    }

    /// Fatal error that stopped this subscriber, if any.
    pub fn err(&self) -> Option<Arc<StreamError>> {
        self.shared.fatal.get()
    }

    /// The subscription sent on every (re)connect.
    pub fn subscription(&self) -> &Subscription {
        &self.shared.subscription
    }

    pub async fn topics(&self) -> Arc<TopicMap> {
        self.shared.stream.topics().await
    }

    pub async fn server_id(&self) -> Option<String> {
        self.shared.stream.server_id().await
    }

    async fn send(&self, request: SubscribeRequest) -> Result<(), StreamError> {
        self.shared.fatal.check()?;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }

        let guard = self.shared.stream.read().await;
        let live = guard.as_ref().ok_or(StreamError::NotOpen)?;
        live.sink.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for Subscriber {
    async fn ack(&self, ack: Ack) -> Result<(), StreamError> {
        Subscriber::ack(self, ack).await
    }

    async fn nack(&self, nack: Nack) -> Result<(), StreamError> {
        Subscriber::nack(self, nack).await
    }
}

impl Shared {
    async fn repair(&self) -> Result<EventSource, StreamError> {
        wait_for_reconnect(self.client.as_ref(), self.options.reconnect_timeout).await?;

        let (live, source) = open_stream(self.client.as_ref(), &self.subscription, &self.options).await?;
        let server_id = live.server_id.clone();
        let generation = self.stream.replace(live).await;

        info!(
            event = "subscribe_stream_reconnected",
            client_id = %self.subscription.client_id,
            server_id = %server_id,
            generation
        );
        Ok(source)
    }
}

async fn open_stream(
    client: &dyn SubscribeClient,
    subscription: &Subscription,
    options: &StreamOptions,
) -> Result<(LiveStream<SubscribeRequest>, EventSource), StreamError> {
    let stream = with_timeout(options.handshake_timeout, client.subscribe_stream())
        .await
        .map_err(|_| StreamError::HandshakeTimeout)??;

    let (live, source, _) = handshake(
        stream,
        SubscribeRequest::Subscription(subscription.clone()),
        |reply| match reply {
            SubscribeReply::Ready(ready) => Some(ready),
            _ => None,
        },
        options.handshake_timeout,
    )
    .await?;
    Ok((live, source))
}

async fn run_lifecycle(
    shared: Arc<Shared>,
    mut source: EventSource,
    events: mpsc::Sender<EventWrapper>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let (down_tx, mut down_rx) = mpsc::channel(1);
        let receiver = tokio::spawn(run_receiver(
            Arc::clone(&shared),
            source,
            events.clone(),
            down_tx,
        ));

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
                drop(events);
                let _ = stop.await;
                return;
            }
            Some(StreamDown::Fatal(err)) => {
                shared.fatal.set(err);
                shared.stream.clear().await;
                return;
            }
            Some(StreamDown::Disconnected(err)) => {
                warn!(
                    event = "subscribe_stream_down",
                    client_id = %shared.subscription.client_id,
                    error = %err
                );

                let repaired = tokio::select! {
                    _ = &mut stop => return,
                    repaired = shared.repair() => repaired,
                };
                match repaired {
                    Ok(next) => source = next,
                    Err(err) => {
                        shared.fatal.set(err);
                        shared.stream.clear().await;
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
        warn!(
            event = "subscribe_receiver_aborted",
            client_id = %shared.subscription.client_id
        );
        receiver.abort();
    }
    shared.stream.clear().await;
}

async fn run_receiver(
    shared: Arc<Shared>,
    mut source: EventSource,
    events: mpsc::Sender<EventWrapper>,
    down: mpsc::Sender<StreamDown>,
) {
    loop {
        let reply = match source.recv().await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                debug!(
                    event = "subscribe_stream_eof",
                    client_id = %shared.subscription.client_id
                );
                return;
            }
            Err(err) => {
                debug!(event = "subscribe_stream_recv_failed", error = %err);
                let _ = down.try_send(StreamDown::Disconnected(err));
                return;
            }
        };

        match reply {
            SubscribeReply::Event(event) => {
                if events.send(event).await.is_err() {
                    debug!(
                        event = "subscribe_consumer_gone",
                        client_id = %shared.subscription.client_id
                    );
                    return;
                }
            }
            SubscribeReply::CloseStream(stats) => {
                debug!(
                    event = "subscribe_stream_closed_by_server",
                    events = stats.events,
                    topics = stats.topics,
                    consumers = stats.consumers
                );
            }
            SubscribeReply::Ready(_) => {
                debug!(event = "subscribe_stream_unexpected_reply", kind = "ready");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    use super::{Acknowledger, Subscriber};
    use crate::config::StreamOptions;
    use crate::mock::{committed_event, event_payload, MockBroker};
    use crate::stream::handle::StreamError;
    use crate::stream::proto::{Ack, Code, Nack, NackCode};
    use crate::stream::transport::TransportError;

    fn options(buffer_size: usize) -> StreamOptions {
        StreamOptions {
            handshake_timeout: Duration::from_secs(2),
            reconnect_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(200),
            buffer_size,
        }
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
    async fn delivers_events_in_order() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let (mut events, subscriber) = Subscriber::with_options(
            Arc::new(broker.clone()),
            vec!["orders".to_string()],
            options(16),
        )
        .await
        .expect("subscribe");

        for offset in 0..5 {
            let event = committed_event(topic_id, offset, &event_payload(format!("e{offset}")));
            assert_eq!(broker.deliver(event).await, 1);
        }
        for offset in 0..5 {
            let event = timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("in time")
                .expect("event");
            assert_eq!(event.offset, offset);
        }

        assert_eq!(broker.subscriptions()[0].topics, vec!["orders".to_string()]);
        subscriber.close().await.expect("close");
        assert!(events.recv().await.is_none(), "channel closes after close");
    }

    #[tokio::test]
    async fn slow_consumer_applies_backpressure() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let (mut events, _subscriber) =
            Subscriber::with_options(Arc::new(broker.clone()), Vec::new(), options(1))
                .await
                .expect("subscribe");

        for offset in 0..4 {
            broker
                .deliver(committed_event(topic_id, offset, &event_payload("x")))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One slot: the first event is buffered, the rest wait in the stream.
        assert_eq!(events.try_recv().expect("buffered").offset, 0);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        for offset in 1..4 {
            let event = timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("in time")
                .expect("event");
            assert_eq!(event.offset, offset, "no events dropped or reordered");
        }
    }

    #[tokio::test]
    async fn acks_and_nacks_reach_the_server() {
        let broker = MockBroker::new();
        let (_events, subscriber) =
            Subscriber::with_options(Arc::new(broker.clone()), Vec::new(), options(4))
                .await
                .expect("subscribe");

        let acker: Arc<dyn Acknowledger> = Arc::new(subscriber);
        acker
            .ack(Ack {
                id: "event-1".to_string(),
                committed: None,
            })
            .await
            .expect("ack");
        acker
            .nack(Nack {
                id: "event-2".to_string(),
                code: NackCode::Unprocessed,
                error: None,
            })
            .await
            .expect("nack");

        wait_until(|| broker.acks().len() == 1 && broker.nacks().len() == 1).await;
        assert_eq!(broker.acks()[0].id, "event-1");
        assert_eq!(broker.nacks()[0].code, NackCode::Unprocessed);
    }

    #[tokio::test]
    async fn rejected_subscription_fails_immediately() {
        let broker = MockBroker::new();
        broker.on_subscribe_open(|subscription| {
            if subscription.topics.iter().any(|topic| topic == "forbidden") {
                Err(TransportError::status(Code::NotFound, "unknown topic forbidden"))
            } else {
                Ok(())
            }
        });

        let err = Subscriber::with_options(
            Arc::new(broker.clone()),
            vec!["forbidden".to_string()],
            options(4),
        )
        .await
        .err()
        .expect("rejected");
        match err {
            StreamError::Transport(err) => assert_eq!(err.code(), Some(Code::NotFound)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.subscribe_streams(), 1);
    }

    #[tokio::test]
    async fn reconnect_resends_the_same_subscription() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let (mut events, subscriber) = Subscriber::with_options(
            Arc::new(broker.clone()),
            vec!["orders".to_string()],
            options(4),
        )
        .await
        .expect("subscribe");

        broker.disconnect();
        wait_until(|| broker.subscribe_streams() == 2).await;

        let delivered = timeout(Duration::from_secs(2), async {
            loop {
                let event = committed_event(topic_id, 7, &event_payload("after"));
                if broker.deliver(event).await == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(delivered.is_ok());

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("in time")
            .expect("event after reconnect");
        assert_eq!(event.offset, 7);

        let subscriptions = broker.subscriptions();
        assert_eq!(subscriptions.len(), 2);
        assert_eq!(subscriptions[0], subscriptions[1]);
        assert_eq!(&subscriptions[0], subscriber.subscription());
        assert!(subscriber.err().is_none());
    }

    #[tokio::test]
    async fn failed_reconnect_is_fatal_and_closes_events() {
        let broker = MockBroker::new();
        broker.set_reconnect(false);
        let (mut events, subscriber) =
            Subscriber::with_options(Arc::new(broker.clone()), Vec::new(), options(4))
                .await
                .expect("subscribe");

        broker.disconnect();
        let closed = timeout(Duration::from_secs(2), events.recv()).await.expect("in time");
        assert!(closed.is_none());
        assert!(matches!(*subscriber.err().expect("fatal"), StreamError::Reconnect));

        let err = subscriber
            .ack(Ack {
                id: "x".to_string(),
                committed: None,
            })
            .await
            .expect_err("fatal subscriber");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn acks_after_close_are_rejected() {
        let broker = MockBroker::new();
        let (_events, subscriber) =
            Subscriber::with_options(Arc::new(broker.clone()), Vec::new(), options(4))
                .await
                .expect("subscribe");
        subscriber.close().await.expect("close");

        let err = subscriber
            .ack(Ack {
                id: "x".to_string(),
                committed: None,
            })
            .await
            .expect_err("closed");
        assert!(matches!(err, StreamError::Closed));
    }
}
