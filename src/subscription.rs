//! Application-facing subscription handle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::event::{Acknowledger, Event};
use crate::stream::handle::StreamError;
use crate::stream::proto::{EventWrapper, Nack, NackCode};
use crate::stream::subscriber::Subscriber;

/// Events delivered for a set of topics, in delivery order.
///
/// Each received [`Event`] acks and nacks through the subscriber that
/// delivered it.
pub struct Subscription {
    events: mpsc::Receiver<EventWrapper>,
    subscriber: Arc<Subscriber>,
}

impl Subscription {
    pub(crate) fn new(events: mpsc::Receiver<EventWrapper>, subscriber: Subscriber) -> Self {
        Self {
            events,
            subscriber: Arc::new(subscriber),
        }
    }

    /// Next event, or `None` once the subscription is closed or has failed.
    ///
    /// An envelope that cannot be decoded is nacked as unprocessed and
    /// returned as an error.
    pub async fn recv(&mut self) -> Option<Result<Event>> {
        let wrapper = self.events.recv().await?;
        let id = wrapper.id.clone();
        let acker: Arc<dyn Acknowledger> = self.subscriber.clone();

        match Event::incoming(wrapper, acker) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!(event = "subscription_event_undecodable", id = %id, error = %err);
                let nack = Nack {
                    id,
                    code: NackCode::Unprocessed,
                    error: Some(err.to_string()),
                };
                if let Err(nack_err) = self.subscriber.nack(nack).await {
                    warn!(event = "subscription_nack_failed", error = %nack_err);
                }
                Some(Err(err))
            }
        }
    }

    /// Closes the underlying stream; `recv` drains what was already
    /// delivered and then returns `None`.
    pub async fn close(&self) -> Result<()> {
        Ok(self.subscriber.close().await?)
    }

    /// Fatal error that ended the subscription, if any.
    pub fn err(&self) -> Option<Arc<StreamError>> {
        self.subscriber.err()
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::Subscription;
    use crate::config::StreamOptions;
    use crate::error::Error;
    use crate::mock::{committed_event, event_payload, MockBroker};
    use crate::stream::proto::NackCode;
    use crate::stream::subscriber::Subscriber;

    async fn subscription(broker: &MockBroker) -> Subscription {
        let (events, subscriber) = Subscriber::with_options(
            Arc::new(broker.clone()),
            vec!["orders".to_string()],
            StreamOptions {
                buffer_size: 8,
                ..StreamOptions::default()
            },
        )
        .await
        .expect("subscribe");
        Subscription::new(events, subscriber)
    }

    #[tokio::test]
    async fn received_events_ack_through_the_subscriber() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let mut sub = subscription(&broker).await;

        let wrapper = committed_event(topic_id, 1, &event_payload("one"));
        broker.deliver(wrapper.clone()).await;

        let mut event = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("in time")
            .expect("open")
            .expect("decoded");
        assert_eq!(event.id(), wrapper.id);
        assert!(event.ack().await.expect("ack"));

        timeout(Duration::from_secs(1), async {
            while broker.acks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ack recorded");
        assert_eq!(broker.acks()[0].id, wrapper.id);
    }

    #[tokio::test]
    async fn undecodable_events_are_nacked() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let mut sub = subscription(&broker).await;

        let mut wrapper = committed_event(topic_id, 1, &event_payload("x"));
        wrapper.event = b"not json".to_vec();
        broker.deliver(wrapper.clone()).await;

        let result = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("in time")
            .expect("open");
        assert!(matches!(result, Err(Error::Envelope(_))));

        timeout(Duration::from_secs(1), async {
            while broker.nacks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("nack recorded");
        let nack = &broker.nacks()[0];
        assert_eq!(nack.id, wrapper.id);
        assert_eq!(nack.code, NackCode::Unprocessed);
    }

    #[tokio::test]
    async fn close_ends_the_event_stream() {
        let broker = MockBroker::new();
        let mut sub = subscription(&broker).await;
        sub.close().await.expect("close");
        let next = timeout(Duration::from_secs(1), sub.recv()).await.expect("in time");
        assert!(next.is_none());
        assert!(sub.err().is_none());
    }
}
