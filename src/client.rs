//! Client facade composing authentication, the transport, topic management
//! and the stream managers.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::AuthClient;
use crate::config::{ConfigError, Options};
use crate::error::Result;
use crate::event::Event;
use crate::query::{build_query, QueryCursor};
use crate::stream::handle::StreamError;
use crate::stream::publisher::Publisher;
use crate::stream::subscriber::Subscriber;
use crate::stream::transport::{PublishClient, QueryClient, SubscribeClient, Transport};
use crate::stream::ws::WsTransport;
use crate::subscription::Subscription;
use crate::topics::cache::TopicCache;
use crate::topics::{ProjectInfo, ServiceState, Topic, TopicState, TopicsClient};

/// Entry point for publishing, subscribing, querying and managing topics.
pub struct Client {
    options: Options,
    auth: Option<Arc<AuthClient>>,
    publish_client: Arc<dyn PublishClient>,
    subscribe_client: Arc<dyn SubscribeClient>,
    query_client: Arc<dyn QueryClient>,
    topics: Arc<TopicsClient>,
    cache: TopicCache,
    publisher: Mutex<Option<Arc<Publisher>>>,
}

impl Client {
    /// Validates `options`, logs in unless authentication is disabled and
    /// connects over websockets.
    pub async fn new(mut options: Options) -> Result<Self> {
        options.validate()?;
        let auth = login(&options).await?;
        let transport = Arc::new(WsTransport::from_options(&options, auth.clone())?);
        Self::compose(options, auth, transport)
    }

    /// Like [`Client::new`] but streams over `transport`, e.g. an in-memory
    /// broker in tests.
    pub async fn with_transport<T>(mut options: Options, transport: Arc<T>) -> Result<Self>
    where
        T: Transport + 'static,
    {
        options.validate()?;
        let auth = login(&options).await?;
        Self::compose(options, auth, transport)
    }

    fn compose<T>(options: Options, auth: Option<Arc<AuthClient>>, transport: Arc<T>) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let topics = Arc::new(TopicsClient::from_options(&options, auth.clone())?);
        let cache = TopicCache::new(topics.clone());
        let publish_client: Arc<dyn PublishClient> = transport.clone();
        let subscribe_client: Arc<dyn SubscribeClient> = transport.clone();
        let query_client: Arc<dyn QueryClient> = transport;

        info!(
            event = "client_ready",
            endpoint = %options.endpoint,
            authenticated = auth.is_some()
        );
        Ok(Self {
            options,
            auth,
            publish_client,
            subscribe_client,
            query_client,
            topics,
            cache,
            publisher: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn auth(&self) -> Option<&Arc<AuthClient>> {
        self.auth.as_ref()
    }

    pub fn topic_cache(&self) -> &TopicCache {
        &self.cache
    }

    /// Publishes `events` to `topic`, a topic id or name.
    ///
    /// Names missing from the stream's handshake are looked up through the
    /// topic cache. Each event moves to the published stage; check its
    /// outcome with [`Event::acked`] or [`Event::wait_for_reply`].
    pub async fn publish(&self, topic: &str, events: &mut [Event]) -> Result<()> {
        for event in events.iter() {
            event.ensure_unpublished()?;
        }

        let publisher = self.publisher().await?;
        for event in events.iter_mut() {
            let payload = event.to_payload();
            let (wrapper, reply) = match publisher.publish_envelope(topic, &payload).await {
                Err(StreamError::ResolveTopic(_)) => {
                    let topic_id = self.cache.get(topic).await?;
                    debug!(event = "publish_topic_from_cache", topic = %topic, topic_id = %topic_id);
                    publisher
                        .publish_envelope(&topic_id.to_string(), &payload)
                        .await?
                }
                result => result?,
            };
            event.mark_published(wrapper, reply)?;
        }
        Ok(())
    }

    /// Opens a subscription to `topics`.
    pub async fn subscribe(&self, topics: &[&str]) -> Result<Subscription> {
        let topics = topics.iter().map(|topic| topic.to_string()).collect();
        let (events, subscriber) = Subscriber::with_options(
            Arc::clone(&self.subscribe_client),
            topics,
            self.options.stream.clone(),
        )
        .await?;
        Ok(Subscription::new(events, subscriber))
    }

    /// Runs a query and returns a cursor over its results.
    pub async fn en_sql(&self, query: &str) -> Result<QueryCursor> {
        self.run_query(query, false).await
    }

    /// Like [`Client::en_sql`], also returning events marked as duplicates.
    pub async fn en_sql_with_duplicates(&self, query: &str) -> Result<QueryCursor> {
        self.run_query(query, true).await
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        Ok(self.topics.list_topics().await?)
    }

    pub async fn create_topic(&self, name: &str) -> Result<Ulid> {
        Ok(self.topics.create_topic(name).await?)
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool> {
        Ok(self.topics.topic_exists(name).await?)
    }

    pub async fn topic_id(&self, name: &str) -> Result<Ulid> {
        Ok(self.topics.topic_id(name).await?)
    }

    pub async fn archive_topic(&self, topic_id: &str) -> Result<TopicState> {
        Ok(self.topics.archive_topic(topic_id).await?)
    }

    pub async fn destroy_topic(&self, topic_id: &str) -> Result<TopicState> {
        Ok(self.topics.destroy_topic(topic_id).await?)
    }

    pub async fn info(&self, topic_ids: &[&str]) -> Result<ProjectInfo> {
        Ok(self.topics.info(topic_ids).await?)
    }

    pub async fn status(&self) -> Result<ServiceState> {
        Ok(self.topics.status().await?)
    }

    /// Closes the publisher if one was opened. A later publish opens a new one.
    pub async fn close(&self) -> Result<()> {
        let publisher = self.publisher.lock().await.take();
        if let Some(publisher) = publisher {
            publisher.close().await?;
        }
        Ok(())
    }

    /// The shared publisher, opened on first use and replaced once it has
    /// failed permanently or the node has ended its stream.
    async fn publisher(&self) -> Result<Arc<Publisher>> {
        let mut guard = self.publisher.lock().await;
        if let Some(publisher) = guard.take() {
            if publisher.is_open().await {
                *guard = Some(Arc::clone(&publisher));
                return Ok(publisher);
            }
            match publisher.err() {
                Some(err) => debug!(event = "publisher_replaced", error = %err),
                None => debug!(event = "publisher_replaced", reason = "stream_ended"),
            }
            if let Err(err) = publisher.close().await {
                debug!(event = "stale_publisher_close_failed", error = %err);
            }
        }

        let publisher = Arc::new(
            Publisher::with_options(Arc::clone(&self.publish_client), self.options.stream.clone())
                .await?,
        );
        *guard = Some(Arc::clone(&publisher));
        Ok(publisher)
    }

    async fn run_query(&self, query: &str, include_duplicates: bool) -> Result<QueryCursor> {
        let query = build_query(query, include_duplicates)?;
        let stream = self.query_client.query_stream(query).await?;
        Ok(QueryCursor::new(stream))
    }
}

async fn login(options: &Options) -> Result<Option<Arc<AuthClient>>> {
    if options.no_authentication {
        return Ok(None);
    }

    let secret = options
        .client_secret
        .clone()
        .ok_or(ConfigError::MissingClientSecret)?;
    let auth = AuthClient::new(&options.auth_url)?;
    auth.login(&options.client_id, secret).await?;
    Ok(Some(Arc::new(auth)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::Client;
    use crate::config::{Options, StreamOptions};
    use crate::error::Error;
    use crate::event::Event;
    use crate::mock::MockBroker;
    use crate::stream::proto::{MimeType, NackCode};

    fn options() -> Options {
        Options::new()
            .with_endpoint("127.0.0.1:9", true)
            .with_authenticator("", true)
            .with_stream_options(StreamOptions {
                handshake_timeout: Duration::from_secs(2),
                reconnect_timeout: Duration::from_millis(200),
                close_timeout: Duration::from_millis(200),
                buffer_size: 16,
            })
    }

    #[tokio::test]
    async fn publishes_events_and_tracks_their_outcome() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let client = Client::with_transport(options(), Arc::new(broker.clone()))
            .await
            .expect("client");

        let mut events = vec![
            Event::new("a", MimeType::TextPlain),
            Event::new("b", MimeType::TextPlain),
        ];
        client.publish("orders", &mut events).await.expect("publish");

        for event in events.iter_mut() {
            assert!(event.wait_for_reply().await.expect("reply"));
            assert_eq!(event.topic_id(), Some(topic_id));
            assert!(!event.id().is_empty());
        }
        assert_eq!(broker.publish_streams(), 1, "publisher is reused");

        let err = client
            .publish("orders", &mut events)
            .await
            .expect_err("already published");
        assert!(matches!(err, Error::AlreadyPublished));

        let mut copies: Vec<Event> = events.iter().map(Event::duplicate).collect();
        client.publish("orders", &mut copies).await.expect("republish");
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn publish_ids_skip_the_topic_map() {
        let broker = MockBroker::new();
        broker.add_topic("orders");
        let client = Client::with_transport(options(), Arc::new(broker.clone()))
            .await
            .expect("client");

        let unknown = ulid::Ulid::new();
        let mut events = vec![Event::new("x", MimeType::TextPlain)];
        client
            .publish(&unknown.to_string(), &mut events)
            .await
            .expect("publish");
        assert!(!events[0].wait_for_reply().await.expect("reply"));
        assert_eq!(
            events[0].rejection().map(|nack| nack.code),
            Some(NackCode::TopicUnknown)
        );
    }

    #[tokio::test]
    async fn subscribes_and_acks_through_the_facade() {
        let broker = MockBroker::new();
        let topic_id = broker.add_topic("orders");
        let client = Client::with_transport(options(), Arc::new(broker.clone()))
            .await
            .expect("client");

        let mut sub = client.subscribe(&["orders"]).await.expect("subscribe");
        broker
            .deliver(crate::mock::committed_event(
                topic_id,
                0,
                &crate::mock::event_payload("hello"),
            ))
            .await;

        let mut event = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("in time")
            .expect("open")
            .expect("event");
        assert!(event.nack(NackCode::UnknownType).await.expect("nack"));
        sub.close().await.expect("close");
    }

    #[tokio::test]
    async fn empty_queries_fail_without_network() {
        let broker = MockBroker::new();
        let client = Client::with_transport(options(), Arc::new(broker))
            .await
            .expect("client");
        assert!(matches!(client.en_sql("").await, Err(Error::EmptyQuery)));
    }

    #[tokio::test]
    async fn failed_publisher_is_replaced_on_next_publish() {
        let broker = MockBroker::new();
        broker.add_topic("orders");
        let client = Client::with_transport(options(), Arc::new(broker.clone()))
            .await
            .expect("client");

        let mut first = vec![Event::new("1", MimeType::TextPlain)];
        client.publish("orders", &mut first).await.expect("publish");
        first[0].wait_for_reply().await.expect("reply");

        broker.set_reconnect(false);
        broker.disconnect();
        timeout(Duration::from_secs(2), async {
            loop {
                let publisher = client.publisher.lock().await.clone();
                if publisher.is_some_and(|publisher| publisher.err().is_some()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("publisher failed");

        broker.set_reconnect(true);
        let mut second = vec![Event::new("2", MimeType::TextPlain)];
        client.publish("orders", &mut second).await.expect("publish again");
        assert!(second[0].wait_for_reply().await.expect("reply"));
        assert_eq!(broker.publish_streams(), 2);
    }

    #[tokio::test]
    async fn authentication_requires_credentials() {
        let options = Options::new()
            .with_endpoint("127.0.0.1:9", true)
            .with_authenticator("http://127.0.0.1:9", false);
        let err = Client::with_transport(options, Arc::new(MockBroker::new()))
            .await
            .err()
            .expect("missing credentials");
        assert!(matches!(err, Error::Config(_)));
    }
}
