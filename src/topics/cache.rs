//! Topic name to id cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use ulid::Ulid;

use crate::topics::{TopicResolver, TopicsError};

/// Remembers topic ids by name so each name is looked up remotely once.
pub struct TopicCache {
    topics: Mutex<HashMap<String, Ulid>>,
    resolver: Arc<dyn TopicResolver>,
}

impl TopicCache {
    pub fn new(resolver: Arc<dyn TopicResolver>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            resolver,
        }
    }

    /// Id of the topic called `topic`, looked up remotely on a miss.
    pub async fn get(&self, topic: &str) -> Result<Ulid, TopicsError> {
        if let Some(topic_id) = self.cached(topic) {
            return Ok(topic_id);
        }

        let topic_id = self.resolver.topic_id(topic).await?;
        self.store(topic, topic_id);
        Ok(topic_id)
    }

    /// Whether the topic exists; cached names are known to exist.
    pub async fn exists(&self, topic: &str) -> Result<bool, TopicsError> {
        if self.cached(topic).is_some() {
            return Ok(true);
        }
        self.resolver.topic_exists(topic).await
    }

    /// Id of the topic, creating it first if it does not exist yet.
    pub async fn ensure(&self, topic: &str) -> Result<Ulid, TopicsError> {
        if let Some(topic_id) = self.cached(topic) {
            return Ok(topic_id);
        }

        let topic_id = if self.resolver.topic_exists(topic).await? {
            self.resolver.topic_id(topic).await?
        } else {
            debug!(event = "topic_cache_create", topic = %topic);
            self.resolver.create_topic(topic).await?
        };
        self.store(topic, topic_id);
        Ok(topic_id)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn cached(&self, topic: &str) -> Option<Ulid> {
        self.lock().get(topic).copied()
    }

    fn store(&self, topic: &str, topic_id: Ulid) {
        self.lock().insert(topic.to_string(), topic_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Ulid>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
