//! Application-facing events and their ack/nack state machine.
//!
//! An [`Event`] is created locally and published, delivered by a subscription,
//! or returned by a query. Each role carries only the state it needs: a
//! published event holds the pending publish reply, a delivered event holds
//! the [`Acknowledger`] its decision goes to. Stages only move forward.

use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::stream::proto::{
    Ack, EventPayload, EventType, EventWrapper, MimeType, Nack, NackCode, PublisherReply,
};

pub use crate::stream::subscriber::Acknowledger;

/// User-defined key/value pairs stored alongside the event data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, or an empty string when it is not set.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Sets `key`, overwriting any existing value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Metadata {
    fn from(values: HashMap<String, String>) -> Self {
        Self(values)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

enum Stage {
    Initialized,
    /// Published, waiting for the server's ack or nack.
    Published(oneshot::Receiver<PublisherReply>),
    /// Delivered by a subscription, waiting for the application's decision.
    Received(Arc<dyn Acknowledger>),
    /// Returned by a query; cannot be acked.
    Queried,
    Acked,
    Nacked,
    /// The publisher dropped the reply before the server answered.
    Abandoned,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Published(_) => "published",
            Self::Received(_) => "received",
            Self::Queried => "queried",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::Abandoned => "abandoned",
        }
    }
}

/// A user datagram ordered by the server.
pub struct Event {
    pub metadata: Metadata,
    pub data: Vec<u8>,
    pub mimetype: MimeType,
    /// Optional schema of `data`.
    pub event_type: Option<EventType>,
    /// Client clock time the event was created.
    pub created: DateTime<Utc>,

    stage: Stage,
    info: Option<EventWrapper>,
    rejection: Option<Nack>,
}

impl Event {
    pub fn new(data: impl Into<Vec<u8>>, mimetype: MimeType) -> Self {
        Self {
            metadata: Metadata::new(),
            data: data.into(),
            mimetype,
            event_type: None,
            created: Utc::now(),
            stage: Stage::Initialized,
            info: None,
            rejection: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.set(key, value);
        self
    }

    pub fn with_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// An event as delivered by a subscription; acks and nacks go to `acker`.
    pub fn incoming(wrapper: EventWrapper, acker: Arc<dyn Acknowledger>) -> Result<Self> {
        Self::from_wrapper(wrapper, Stage::Received(acker))
    }

    /// An event already sent to the server whose outcome arrives on `reply`.
    pub fn outgoing(wrapper: EventWrapper, reply: oneshot::Receiver<PublisherReply>) -> Result<Self> {
        Self::from_wrapper(wrapper, Stage::Published(reply))
    }

    pub(crate) fn queried(wrapper: EventWrapper) -> Result<Self> {
        Self::from_wrapper(wrapper, Stage::Queried)
    }

    fn from_wrapper(wrapper: EventWrapper, stage: Stage) -> Result<Self> {
        let payload = wrapper.unwrap_payload()?;
        Ok(Self {
            metadata: Metadata::from(payload.metadata),
            data: payload.data,
            mimetype: payload.mimetype,
            event_type: payload.event_type,
            created: payload.created,
            stage,
            info: Some(wrapper),
            rejection: None,
        })
    }

    /// Content to wrap for publishing.
    pub fn to_payload(&self) -> EventPayload {
        EventPayload {
            data: self.data.clone(),
            metadata: self.metadata.0.clone(),
            mimetype: self.mimetype.clone(),
            event_type: self.event_type.clone(),
            created: self.created,
        }
    }

    /// Moves a locally created event into the published stage.
    pub(crate) fn mark_published(
        &mut self,
        wrapper: EventWrapper,
        reply: oneshot::Receiver<PublisherReply>,
    ) -> Result<()> {
        if !matches!(self.stage, Stage::Initialized) {
            return Err(Error::AlreadyPublished);
        }
        self.stage = Stage::Published(reply);
        self.info = Some(wrapper);
        Ok(())
    }

    pub(crate) fn ensure_unpublished(&self) -> Result<()> {
        match self.stage {
            Stage::Initialized => Ok(()),
            _ => Err(Error::AlreadyPublished),
        }
    }

    /// Server-assigned id, empty until the server has committed the event.
    pub fn id(&self) -> &str {
        self.info.as_ref().map(|info| info.id.as_str()).unwrap_or_default()
    }

    pub fn topic_id(&self) -> Option<Ulid> {
        self.info.as_ref().map(|info| info.topic_id)
    }

    /// Correlation id used when this event was published.
    pub fn local_id(&self) -> Option<Ulid> {
        self.info.as_ref().and_then(|info| info.local_id)
    }

    /// `(offset, epoch)`, both zero when unknown.
    pub fn offset(&self) -> (u64, u64) {
        self.info
            .as_ref()
            .map(|info| (info.offset, info.epoch))
            .unwrap_or_default()
    }

    pub fn committed(&self) -> Option<DateTime<Utc>> {
        self.info.as_ref().and_then(|info| info.committed)
    }

    /// Envelope this event was published in or delivered with.
    pub fn info(&self) -> Option<&EventWrapper> {
        self.info.as_ref()
    }

    /// The server's nack, if it rejected this published event.
    pub fn rejection(&self) -> Option<&Nack> {
        self.rejection.as_ref()
    }

    /// Whether the server acked this published event, polling the reply
    /// without blocking.
    pub fn acked(&mut self) -> Result<bool> {
        self.poll_reply()?;
        Ok(matches!(self.stage, Stage::Acked))
    }

    /// Whether the server nacked this published event, polling the reply
    /// without blocking. The server's code and message are read from
    /// [`Event::rejection`].
    pub fn nacked(&mut self) -> Result<bool> {
        self.poll_reply()?;
        Ok(matches!(self.stage, Stage::Nacked))
    }

    /// Waits for the publish outcome: `true` for an ack, `false` for a nack.
    pub async fn wait_for_reply(&mut self) -> Result<bool> {
        match &mut self.stage {
            Stage::Published(reply) => match reply.await {
                Ok(reply) => self.apply_reply(reply)?,
                Err(_) => {
                    self.stage = Stage::Abandoned;
                    return Err(Error::ReplyAbandoned);
                }
            },
            Stage::Acked | Stage::Nacked => {}
            Stage::Abandoned => return Err(Error::ReplyAbandoned),
            _ => return Err(Error::NotPublished),
        }
        Ok(matches!(self.stage, Stage::Acked))
    }

    /// Acknowledges a delivered event.
    ///
    /// Returns `true` when acked (again), `false` when the event was already
    /// nacked. Nothing is sent in either case.
    pub async fn ack(&mut self) -> Result<bool> {
        let acker = match &self.stage {
            Stage::Acked => return Ok(true),
            Stage::Nacked => return Ok(false),
            Stage::Received(acker) => Arc::clone(acker),
            _ => return Err(Error::CannotAck),
        };

        acker
            .ack(Ack {
                id: self.id().to_string(),
                committed: None,
            })
            .await?;
        self.stage = Stage::Acked;
        Ok(true)
    }

    /// Rejects a delivered event; `code` tells the server how to handle it.
    ///
    /// Returns `true` when nacked (again), `false` when the event was already
    /// acked.
    pub async fn nack(&mut self, code: NackCode) -> Result<bool> {
        let acker = match &self.stage {
            Stage::Nacked => return Ok(true),
            Stage::Acked => return Ok(false),
            Stage::Received(acker) => Arc::clone(acker),
            _ => return Err(Error::CannotAck),
        };

        acker
            .nack(Nack {
                id: self.id().to_string(),
                code,
                error: None,
            })
            .await?;
        self.stage = Stage::Nacked;
        Ok(true)
    }

    /// A new, unpublished event with the same content and a fresh timestamp.
    pub fn duplicate(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            data: self.data.clone(),
            mimetype: self.mimetype.clone(),
            event_type: self.event_type.clone(),
            created: Utc::now(),
            stage: Stage::Initialized,
            info: None,
            rejection: None,
        }
    }

    fn poll_reply(&mut self) -> Result<()> {
        let polled = match &mut self.stage {
            Stage::Published(reply) => reply.try_recv(),
            Stage::Abandoned => return Err(Error::ReplyAbandoned),
            _ => return Ok(()),
        };
        match polled {
            Ok(reply) => self.apply_reply(reply),
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Closed) => {
                self.stage = Stage::Abandoned;
                Err(Error::ReplyAbandoned)
            }
        }
    }

    fn apply_reply(&mut self, reply: PublisherReply) -> Result<()> {
        match reply {
            PublisherReply::Ack(ack) => {
                if let Some(info) = self.info.as_mut() {
                    info.id = ack.id;
                    info.committed = ack.committed;
                }
                self.stage = Stage::Acked;
                Ok(())
            }
            PublisherReply::Nack(nack) => {
                self.rejection = Some(nack);
                self.stage = Stage::Nacked;
                Ok(())
            }
            other => Err(Error::UnhandledReply(format!("{other:?}"))),
        }
    }
}

/// Content equality: mimetype, type, created, metadata and data.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.mimetype == other.mimetype
            && self.event_type == other.event_type
            && self.created == other.created
            && self.metadata == other.metadata
            && self.data == other.data
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("metadata", &self.metadata)
            .field("data_len", &self.data.len())
            .field("mimetype", &self.mimetype)
            .field("event_type", &self.event_type)
            .field("created", &self.created)
            .field("stage", &self.stage.name())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::oneshot;
    use ulid::Ulid;

    use super::{Acknowledger, Event, Metadata};
    use crate::error::Error;
    use crate::mock::{committed_event, event_payload};
    use crate::stream::handle::StreamError;
    use crate::stream::proto::{
        Ack, EventType, EventWrapper, MimeType, Nack, NackCode, PublisherReply,
    };

    #[derive(Default)]
    struct RecordingAcker {
        acks: Mutex<Vec<Ack>>,
        nacks: Mutex<Vec<Nack>>,
        fail: bool,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self, ack: Ack) -> Result<(), StreamError> {
            if self.fail {
                return Err(StreamError::NotOpen);
            }
            self.acks.lock().expect("acks").push(ack);
            Ok(())
        }

        async fn nack(&self, nack: Nack) -> Result<(), StreamError> {
            if self.fail {
                return Err(StreamError::NotOpen);
            }
            self.nacks.lock().expect("nacks").push(nack);
            Ok(())
        }
    }

    fn delivered() -> EventWrapper {
        committed_event(Ulid::new(), 3, &event_payload("hello"))
    }

    #[tokio::test]
    async fn ack_sends_once_and_repeats_quietly() {
        let acker = Arc::new(RecordingAcker::default());
        let wrapper = delivered();
        let mut event = Event::incoming(wrapper.clone(), acker.clone()).expect("event");
        assert_eq!(event.data, b"hello");
        assert_eq!(event.offset(), (3, 1));

        assert!(event.ack().await.expect("ack"));
        assert!(event.ack().await.expect("repeat ack"));
        assert!(!event.nack(NackCode::Unprocessed).await.expect("opposite"));

        let acks = acker.acks.lock().expect("acks").clone();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].id, wrapper.id);
        assert!(acker.nacks.lock().expect("nacks").is_empty());
    }

    #[tokio::test]
    async fn nack_then_ack_is_not_applicable() {
        let acker = Arc::new(RecordingAcker::default());
        let mut event = Event::incoming(delivered(), acker.clone()).expect("event");

        assert!(event.nack(NackCode::UnknownType).await.expect("nack"));
        assert!(event.nack(NackCode::UnknownType).await.expect("repeat nack"));
        assert!(!event.ack().await.expect("opposite"));

        assert!(acker.acks.lock().expect("acks").is_empty());
        let nacks = acker.nacks.lock().expect("nacks").clone();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].code, NackCode::UnknownType);
    }

    #[tokio::test]
    async fn failed_ack_keeps_the_event_receivable() {
        let acker = Arc::new(RecordingAcker {
            fail: true,
            ..RecordingAcker::default()
        });
        let mut event = Event::incoming(delivered(), acker).expect("event");
        assert!(matches!(event.ack().await, Err(Error::Stream(StreamError::NotOpen))));
        assert!(matches!(event.ack().await, Err(Error::Stream(_))));
    }

    #[tokio::test]
    async fn local_and_published_events_cannot_be_acked() {
        let mut local = Event::new("local", MimeType::TextPlain);
        assert!(matches!(local.ack().await, Err(Error::CannotAck)));
        assert!(matches!(local.nack(NackCode::Unknown).await, Err(Error::CannotAck)));

        let (_tx, rx) = oneshot::channel();
        let mut published = Event::outgoing(delivered(), rx).expect("event");
        assert!(matches!(published.ack().await, Err(Error::CannotAck)));

        let mut queried = Event::queried(delivered()).expect("event");
        assert!(matches!(queried.nack(NackCode::Unknown).await, Err(Error::CannotAck)));
    }

    #[test]
    fn publish_ack_updates_server_fields() {
        let (tx, rx) = oneshot::channel();
        let mut wrapper = delivered();
        wrapper.id.clear();
        wrapper.committed = None;
        let mut event = Event::outgoing(wrapper, rx).expect("event");

        assert!(!event.acked().expect("pending"));
        assert!(!event.nacked().expect("pending"));

        let committed = Utc::now();
        tx.send(PublisherReply::Ack(Ack {
            id: "server-id".to_string(),
            committed: Some(committed),
        }))
        .expect("send");

        assert!(event.acked().expect("acked"));
        assert!(!event.nacked().expect("not nacked"));
        assert_eq!(event.id(), "server-id");
        assert_eq!(event.committed(), Some(committed));
    }

    #[test]
    fn publish_nack_is_kept_as_rejection() {
        let (tx, rx) = oneshot::channel();
        let mut event = Event::outgoing(delivered(), rx).expect("event");
        tx.send(PublisherReply::Nack(Nack {
            id: "x".to_string(),
            code: NackCode::TopicArchived,
            error: Some("archived".to_string()),
        }))
        .expect("send");

        assert!(event.nacked().expect("nacked"));
        assert!(!event.acked().expect("not acked"));
        let rejection = event.rejection().expect("rejection");
        assert_eq!(rejection.code, NackCode::TopicArchived);
        assert_eq!(rejection.error.as_deref(), Some("archived"));
    }

    #[test]
    fn abandoned_reply_is_an_error() {
        let (tx, rx) = oneshot::channel::<PublisherReply>();
        let mut event = Event::outgoing(delivered(), rx).expect("event");
        drop(tx);
        assert!(matches!(event.acked(), Err(Error::ReplyAbandoned)));
        assert!(matches!(event.nacked(), Err(Error::ReplyAbandoned)));
    }

    #[tokio::test]
    async fn wait_for_reply_resolves_the_outcome() {
        let (tx, rx) = oneshot::channel();
        let mut event = Event::outgoing(delivered(), rx).expect("event");
        tokio::spawn(async move {
            let _ = tx.send(PublisherReply::Ack(Ack {
                id: "id".to_string(),
                committed: None,
            }));
        });
        assert!(event.wait_for_reply().await.expect("reply"));
        assert!(event.wait_for_reply().await.expect("cached"));

        let mut local = Event::new("x", MimeType::TextPlain);
        assert!(matches!(local.wait_for_reply().await, Err(Error::NotPublished)));
    }

    #[test]
    fn events_publish_only_once() {
        let mut event = Event::new("x", MimeType::TextPlain);
        let (_tx, rx) = oneshot::channel();
        event.mark_published(delivered(), rx).expect("first");
        let (_tx, rx) = oneshot::channel();
        assert!(matches!(event.mark_published(delivered(), rx), Err(Error::AlreadyPublished)));

        let copy = event.duplicate();
        assert!(copy.ensure_unpublished().is_ok());
        assert!(copy.info().is_none());
        assert_eq!(copy.data, event.data);
    }

    #[test]
    fn equality_compares_content_only() {
        let original = Event::new("data", MimeType::ApplicationJson)
            .with_metadata("key", "value")
            .with_type(EventType::new("Order", 1, 2, 0));
        let (_tx, rx) = oneshot::channel();
        let mut wrapper = delivered();
        wrapper.set_payload(&original.to_payload()).expect("payload");
        let received = Event::outgoing(wrapper, rx).expect("event");
        assert_eq!(original, received);

        let mut changed = original.duplicate();
        changed.created = original.created;
        assert_eq!(original, changed);
        changed.metadata.set("key", "other");
        assert_ne!(original, changed);
    }

    #[test]
    fn metadata_defaults_to_empty_values() {
        let mut metadata: Metadata = [("a", "1")].into_iter().collect();
        assert_eq!(metadata.get("a"), "1");
        assert_eq!(metadata.get("missing"), "");
        metadata.set("a", "2");
        assert_eq!(metadata.get("a"), "2");
        assert_eq!(metadata.len(), 1);
    }
}
