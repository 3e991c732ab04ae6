//! Reconnect and correlation primitives shared by the publisher and
//! subscriber.
//!
//! A [`StreamHandle`] holds the send half of the live stream together with
//! the topic map and server id learned in its handshake. The whole snapshot is
//! swapped under the write lock on reconnect, so a sender holding the read
//! lock always sees one consistent stream.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::retry::with_timeout;
use crate::stream::envelope::EnvelopeError;
use crate::stream::proto::StreamReady;
use crate::stream::transport::{
    BidiStream, ConnectionObserver, StreamSink, StreamSource, TransportError,
};

/// Topic name to topic id, as returned by a handshake.
pub type TopicMap = HashMap<String, Ulid>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("could not initialize stream with server")]
    Uninitialized,

    #[error("failed to reconnect to remote server within timeout")]
    Reconnect,

    #[error("timed out waiting for stream handshake")]
    HandshakeTimeout,

    #[error("could not resolve topic {0:?}: specify a topic id or a topic name allowed on this stream")]
    ResolveTopic(String),

    #[error("server sent malformed correlation id {0:?}")]
    MalformedId(String),

    #[error("stream is not open")]
    NotOpen,

    #[error("stream manager is closed")]
    Closed,

    #[error("stream manager stopped after a fatal error: {0}")]
    Fatal(Arc<StreamError>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl StreamError {
    /// Whether the manager can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Write-once storage for the error that stopped a manager.
#[derive(Default)]
pub(crate) struct FatalSlot {
    inner: StdRwLock<Option<Arc<StreamError>>>,
}

impl FatalSlot {
    /// Records `err` unless a fatal error is already set.
    pub(crate) fn set(&self, err: StreamError) {
        if let Ok(mut guard) = self.inner.write() {
            if guard.is_none() {
                warn!(event = "stream_fatal", error = %err);
                *guard = Some(Arc::new(err));
            }
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<StreamError>> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }

    /// `Err(Fatal)` once a fatal error has been recorded.
    pub(crate) fn check(&self) -> Result<(), StreamError> {
        match self.get() {
            Some(err) => Err(StreamError::Fatal(err)),
            None => Ok(()),
        }
    }
}

/// Send half of an open stream plus the handshake results that came with it.
pub(crate) struct LiveStream<Req: Send + 'static> {
    pub(crate) sink: Box<dyn StreamSink<Req>>,
    pub(crate) server_id: String,
    pub(crate) topics: Arc<TopicMap>,
    pub(crate) generation: u64,
}

impl<Req: Send + 'static> LiveStream<Req> {
    pub(crate) fn new(sink: Box<dyn StreamSink<Req>>, ready: &StreamReady) -> Self {
        Self {
            sink,
            server_id: ready.server_id.clone(),
            topics: Arc::new(topic_map(ready)),
            generation: 0,
        }
    }
}

pub(crate) struct StreamHandle<Req: Send + 'static> {
    live: RwLock<Option<LiveStream<Req>>>,
    generations: AtomicU64,
}

impl<Req: Send + 'static> StreamHandle<Req> {
    pub(crate) fn new(mut live: LiveStream<Req>) -> Self {
        live.generation = 1;
        Self {
            live: RwLock::new(Some(live)),
            generations: AtomicU64::new(1),
        }
    }

    pub(crate) async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, Option<LiveStream<Req>>> {
        self.live.read().await
    }

    /// Installs a freshly handshaken stream and returns its generation.
    pub(crate) async fn replace(&self, mut live: LiveStream<Req>) -> u64 {
        let mut guard = self.live.write().await;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        live.generation = generation;
        *guard = Some(live);
        generation
    }

    /// Drops the live stream so later sends fail with `NotOpen`.
    pub(crate) async fn clear(&self) {
        self.live.write().await.take();
    }

    pub(crate) async fn is_live(&self) -> bool {
        self.live.read().await.is_some()
    }

    pub(crate) async fn close_send(&self) -> Result<(), StreamError> {
        let guard = self.live.read().await;
        match guard.as_ref() {
            Some(live) => Ok(live.sink.close_send().await?),
            None => Ok(()),
        }
    }

    pub(crate) async fn topics(&self) -> Arc<TopicMap> {
        let guard = self.live.read().await;
        guard
            .as_ref()
            .map(|live| Arc::clone(&live.topics))
            .unwrap_or_default()
    }

    pub(crate) async fn server_id(&self) -> Option<String> {
        let guard = self.live.read().await;
        guard.as_ref().map(|live| live.server_id.clone())
    }
}

/// Builds the name to id map from a handshake, skipping ids that do not parse.
pub(crate) fn topic_map(ready: &StreamReady) -> TopicMap {
    ready
        .topics
        .iter()
        .filter_map(|(name, id)| match Ulid::from_string(id) {
            Ok(topic_id) => Some((name.clone(), topic_id)),
            Err(_) => {
                debug!(event = "handshake_topic_ignored", topic = %name, id = %id);
                None
            }
        })
        .collect()
}

/// Resolves a topic reference: an id string first, then a name in `topics`.
pub fn resolve_topic(topic: &str, topics: &TopicMap) -> Result<Ulid, StreamError> {
    if let Ok(topic_id) = Ulid::from_string(topic) {
        return Ok(topic_id);
    }
    topics
        .get(topic)
        .copied()
        .ok_or_else(|| StreamError::ResolveTopic(topic.to_string()))
}

/// Sends the opening message on `stream` and waits for the server's ready.
///
/// A server rejection surfaces as the transport error it came with; any other
/// first reply, or end-of-stream, is `Uninitialized`.
pub(crate) async fn handshake<Req, Rep, F>(
    stream: BidiStream<Req, Rep>,
    open: Req,
    ready_from: F,
    timeout: Duration,
) -> Result<(LiveStream<Req>, Box<dyn StreamSource<Rep>>, StreamReady), StreamError>
where
    Req: Send + 'static,
    Rep: Send + fmt::Debug + 'static,
    F: FnOnce(Rep) -> Option<StreamReady>,
{
    let BidiStream { sink, mut source } = stream;

    let first = with_timeout(timeout, async {
        sink.send(open).await?;
        source.recv().await
    })
    .await
    .map_err(|_| StreamError::HandshakeTimeout)??;

    let ready = match first {
        Some(reply) => {
            let label = format!("{reply:?}");
            match ready_from(reply) {
                Some(ready) => ready,
                None => {
                    debug!(event = "handshake_unexpected_reply", reply = %label);
                    return Err(StreamError::Uninitialized);
                }
            }
        }
        None => return Err(StreamError::Uninitialized),
    };

    debug!(
        event = "stream_ready",
        server_id = %ready.server_id,
        topics = ready.topics.len()
    );
    Ok((LiveStream::new(sink, &ready), source, ready))
}

/// Waits for the connection to come back, bounded by `timeout`.
pub(crate) async fn wait_for_reconnect<O>(observer: &O, timeout: Duration) -> Result<(), StreamError>
where
    O: ConnectionObserver + ?Sized,
{
    debug!(
        event = "stream_reconnect_wait",
        state = ?observer.conn_state(),
        timeout_ms = timeout.as_millis() as u64
    );
    if observer.wait_for_reconnect(timeout).await {
        Ok(())
    } else {
        Err(StreamError::Reconnect)
    }
}

/// Reason a receive loop stopped.
#[derive(Debug)]
pub(crate) enum StreamDown {
    /// Transport failure; the stream may be repaired by reconnecting.
    Disconnected(TransportError),
    /// Protocol violation; the manager must stop.
    Fatal(StreamError),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ulid::Ulid;

    use super::{resolve_topic, topic_map, FatalSlot, StreamError};
    use crate::stream::proto::StreamReady;

    #[test]
    fn resolve_prefers_parseable_ids() {
        let id = Ulid::new();
        let other = Ulid::new();
        let topics = HashMap::from([(id.to_string(), other)]);
        assert_eq!(resolve_topic(&id.to_string(), &topics).expect("id"), id);
    }

    #[test]
    fn resolve_falls_back_to_topic_names() {
        let id = Ulid::new();
        let topics = HashMap::from([("orders".to_string(), id)]);
        assert_eq!(resolve_topic("orders", &topics).expect("name"), id);
        assert!(matches!(
            resolve_topic("shipments", &topics),
            Err(StreamError::ResolveTopic(name)) if name == "shipments"
        ));
    }

    #[test]
    fn handshake_topics_skip_malformed_ids() {
        let id = Ulid::new();
        let ready = StreamReady {
            client_id: "c".to_string(),
            server_id: "s".to_string(),
            topics: HashMap::from([
                ("orders".to_string(), id.to_string()),
                ("broken".to_string(), "not-a-ulid".to_string()),
            ]),
        };
        let topics = topic_map(&ready);
        assert_eq!(topics.len(), 1);
        assert_eq!(topics.get("orders"), Some(&id));
    }

    #[test]
    fn fatal_slot_keeps_first_error() {
        let slot = FatalSlot::default();
        assert!(slot.check().is_ok());
        slot.set(StreamError::Reconnect);
        slot.set(StreamError::Uninitialized);
        match slot.check() {
            Err(StreamError::Fatal(inner)) => assert!(matches!(*inner, StreamError::Reconnect)),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
