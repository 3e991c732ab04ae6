//! Stream protocol messages exchanged with an Ensign node.
//!
//! Every message is a JSON object tagged by `type`. Binary fields (event
//! payloads and wrapped events) travel as standard base64 strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

/// Publisher to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublisherRequest {
    OpenStream(OpenStream),
    Event(EventWrapper),
}

/// Server to publisher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublisherReply {
    Ready(StreamReady),
    Ack(Ack),
    Nack(Nack),
    CloseStream(CloseStream),
}

/// Subscriber to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscribeRequest {
    Subscription(Subscription),
    Ack(Ack),
    Nack(Nack),
}

/// Server to subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscribeReply {
    Ready(StreamReady),
    Event(EventWrapper),
    CloseStream(CloseStream),
}

/// Handshake sent by a publisher when a stream is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenStream {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

/// Handshake sent by a subscriber; resent verbatim on every reconnect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: String,
    pub topics: Vec<String>,
}

/// Server acceptance of a handshake.
///
/// `topics` maps topic names to topic ids in their ULID string form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamReady {
    pub client_id: String,
    pub server_id: String,
    #[serde(default)]
    pub topics: HashMap<String, String>,
}

/// Positive acknowledgement. On a publish stream `id` is the local id of the
/// published event; on a subscribe stream it is the server event id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<DateTime<Utc>>,
}

/// Negative acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Nack {
    pub id: String,
    pub code: NackCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NackCode {
    Unknown,
    MaxDeliveryAttemptsExceeded,
    UnknownType,
    Unprocessed,
    Timeout,
    TopicUnknown,
    TopicArchived,
    TopicDeleted,
}

impl fmt::Display for NackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::MaxDeliveryAttemptsExceeded => "max delivery attempts exceeded",
            Self::UnknownType => "unknown type",
            Self::Unprocessed => "unprocessed",
            Self::Timeout => "timeout",
            Self::TopicUnknown => "topic unknown",
            Self::TopicArchived => "topic archived",
            Self::TopicDeleted => "topic deleted",
        };
        f.write_str(label)
    }
}

/// Statistics sent by the server when it closes a stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseStream {
    #[serde(default)]
    pub events: u64,
    #[serde(default)]
    pub topics: u64,
    #[serde(default)]
    pub consumers: u64,
}

/// Read-only query request opening a result stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub query: String,
    #[serde(default)]
    pub include_duplicates: bool,
}

/// Envelope carrying an encoded event plus routing and commit metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventWrapper {
    /// Server assigned event id; empty until the event is committed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic_id: Ulid,
    /// Client assigned correlation id used to match publish replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<Ulid>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<DateTime<Utc>>,
    #[serde(with = "base64_bytes")]
    pub event: Vec<u8>,
}

/// Event content as the application sees it, before wrapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPayload {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub mimetype: MimeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    pub created: DateTime<Utc>,
}

/// Content type of an event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum MimeType {
    #[default]
    Unspecified,
    TextPlain,
    TextCsv,
    TextHtml,
    ApplicationJson,
    ApplicationMsgpack,
    ApplicationProtobuf,
    ApplicationParquet,
    ApplicationAvro,
    ApplicationXml,
    ApplicationOctetStream,
    /// Any other `type/subtype` string.
    Other(String),
}

impl MimeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unspecified => "unspecified",
            Self::TextPlain => "text/plain",
            Self::TextCsv => "text/csv",
            Self::TextHtml => "text/html",
            Self::ApplicationJson => "application/json",
            Self::ApplicationMsgpack => "application/msgpack",
            Self::ApplicationProtobuf => "application/protobuf",
            Self::ApplicationParquet => "application/parquet",
            Self::ApplicationAvro => "application/avro",
            Self::ApplicationXml => "application/xml",
            Self::ApplicationOctetStream => "application/octet-stream",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MimeType {
    /// Maps a content type string onto a known variant, falling back to `Other`.
    pub fn from_name(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "unspecified" => Self::Unspecified,
            "text/plain" => Self::TextPlain,
            "text/csv" => Self::TextCsv,
            "text/html" => Self::TextHtml,
            "application/json" => Self::ApplicationJson,
            "application/msgpack" | "application/x-msgpack" => Self::ApplicationMsgpack,
            "application/protobuf" | "application/x-protobuf" => Self::ApplicationProtobuf,
            "application/parquet" => Self::ApplicationParquet,
            "application/avro" => Self::ApplicationAvro,
            "application/xml" => Self::ApplicationXml,
            "application/octet-stream" => Self::ApplicationOctetStream,
            _ => Self::Other(normalized),
        }
    }
}

impl FromStr for MimeType {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(value))
    }
}

impl Serialize for MimeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MimeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_name(&value))
    }
}

/// Named, semantically versioned schema type of an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventType {
    pub name: String,
    #[serde(default)]
    pub major_version: u32,
    #[serde(default)]
    pub minor_version: u32,
    #[serde(default)]
    pub patch_version: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("could not parse version string as a semantic version 2.0.0")]
pub struct SemverError;

impl EventType {
    pub fn new(name: impl Into<String>, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            name: name.into(),
            major_version: major,
            minor_version: minor,
            patch_version: patch,
        }
    }

    /// Human readable `Name vX.Y.Z`.
    pub fn version(&self) -> String {
        format!("{} v{}", self.name, self.semver())
    }

    pub fn semver(&self) -> String {
        format!(
            "{}.{}.{}",
            self.major_version, self.minor_version, self.patch_version
        )
    }

    /// Sets the version fields from a semver 2.0.0 string.
    ///
    /// Pre-release and build metadata are validated but not stored.
    pub fn parse_semver(&mut self, version: &str) -> Result<(), SemverError> {
        let (core, build) = match version.split_once('+') {
            Some((core, build)) => (core, Some(build)),
            None => (version, None),
        };
        let (core, prerelease) = match core.split_once('-') {
            Some((core, prerelease)) => (core, Some(prerelease)),
            None => (core, None),
        };

        if let Some(build) = build {
            if !build.split('.').all(is_identifier) {
                return Err(SemverError);
            }
        }
        if let Some(prerelease) = prerelease {
            let valid = prerelease.split('.').all(|part| {
                is_identifier(part)
                    && (!part.bytes().all(|b| b.is_ascii_digit()) || is_numeric_component(part))
            });
            if !valid {
                return Err(SemverError);
            }
        }

        let mut parts = core.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SemverError);
        };

        let major = parse_component(major)?;
        let minor = parse_component(minor)?;
        let patch = parse_component(patch)?;
        self.major_version = major;
        self.minor_version = minor;
        self.patch_version = patch;
        Ok(())
    }
}

/// Names compare case-insensitively after trimming; versions must match.
impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.name.trim().to_lowercase() == other.name.trim().to_lowercase()
            && self.major_version == other.major_version
            && self.minor_version == other.minor_version
            && self.patch_version == other.patch_version
    }
}

impl Eq for EventType {}

fn is_identifier(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn is_numeric_component(part: &str) -> bool {
    !part.is_empty()
        && part.bytes().all(|b| b.is_ascii_digit())
        && (part == "0" || !part.starts_with('0'))
}

fn parse_component(part: &str) -> Result<u32, SemverError> {
    if !is_numeric_component(part) {
        return Err(SemverError);
    }
    part.parse().map_err(|_| SemverError)
}

/// gRPC-style status codes reported by the server when it rejects a stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid argument",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::PermissionDenied => "permission denied",
            Self::ResourceExhausted => "resource exhausted",
            Self::FailedPrecondition => "failed precondition",
            Self::Aborted => "aborted",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::Unauthenticated => "unauthenticated",
        };
        f.write_str(label)
    }
}

/// Terminal status frame; the server sends it instead of a reply to end a
/// stream with an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusFrame {
    pub status: Code,
    pub message: String,
}

macro_rules! impl_text_codec {
    ($($message:ty),+ $(,)?) => {
        $(
            impl $message {
                pub fn to_text(&self) -> Result<String, serde_json::Error> {
                    serde_json::to_string(self)
                }

                pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
                    serde_json::from_str(text)
                }
            }
        )+
    };
}

impl_text_codec!(
    PublisherRequest,
    PublisherReply,
    SubscribeRequest,
    SubscribeReply,
    Query,
    EventWrapper,
    StatusFrame,
);

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
