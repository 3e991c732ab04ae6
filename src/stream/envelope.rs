//! Wrapping and unwrapping of event payloads inside stream envelopes.

use thiserror::Error;
use ulid::Ulid;

use crate::stream::proto::{EventPayload, EventWrapper};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("event wrapper contains no event")]
    Empty,

    #[error("could not encode or decode wrapped event: {0}")]
    Codec(#[from] serde_json::Error),
}

impl EventWrapper {
    /// Builds an outgoing envelope for `payload` addressed to `topic_id`.
    ///
    /// Server assigned fields (id, offset, epoch, committed) start empty.
    pub fn wrap(
        topic_id: Ulid,
        local_id: Option<Ulid>,
        payload: &EventPayload,
    ) -> Result<Self, EnvelopeError> {
        let mut wrapper = Self {
            id: String::new(),
            topic_id,
            local_id,
            offset: 0,
            epoch: 0,
            committed: None,
            event: Vec::new(),
        };
        wrapper.set_payload(payload)?;
        Ok(wrapper)
    }

    /// Replaces the encoded event carried by this envelope.
    pub fn set_payload(&mut self, payload: &EventPayload) -> Result<(), EnvelopeError> {
        self.event = serde_json::to_vec(payload)?;
        Ok(())
    }

    /// Decodes the carried event.
    pub fn unwrap_payload(&self) -> Result<EventPayload, EnvelopeError> {
        if self.event.is_empty() {
            return Err(EnvelopeError::Empty);
        }
        Ok(serde_json::from_slice(&self.event)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    use super::EnvelopeError;
    use crate::stream::proto::{EventPayload, EventType, EventWrapper, MimeType};

    fn payload() -> EventPayload {
        EventPayload {
            data: br#"{"order":42}"#.to_vec(),
            metadata: HashMap::from([("region".to_string(), "us-east".to_string())]),
            mimetype: MimeType::ApplicationJson,
            event_type: Some(EventType::new("OrderPlaced", 1, 2, 0)),
            created: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("timestamp"),
        }
    }

    #[test]
    fn wrap_preserves_addressing_and_payload() {
        let topic_id = Ulid::new();
        let local_id = Ulid::new();
        let wrapper = EventWrapper::wrap(topic_id, Some(local_id), &payload()).expect("wrap");

        assert_eq!(wrapper.topic_id, topic_id);
        assert_eq!(wrapper.local_id, Some(local_id));
        assert!(wrapper.id.is_empty());
        assert!(wrapper.committed.is_none());
        assert_eq!(wrapper.unwrap_payload().expect("unwrap"), payload());
    }

    #[test]
    fn unwrap_rejects_empty_envelope() {
        let mut wrapper = EventWrapper::wrap(Ulid::new(), None, &payload()).expect("wrap");
        wrapper.event.clear();
        assert!(matches!(wrapper.unwrap_payload(), Err(EnvelopeError::Empty)));
    }

    #[test]
    fn unwrap_rejects_garbage() {
        let mut wrapper = EventWrapper::wrap(Ulid::new(), None, &payload()).expect("wrap");
        wrapper.event = b"not an event".to_vec();
        assert!(matches!(wrapper.unwrap_payload(), Err(EnvelopeError::Codec(_))));
    }
}
