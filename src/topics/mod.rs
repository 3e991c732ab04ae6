//! Topic management over the node's REST API.
//!
//! [`TopicsClient`] lists, creates, looks up and retires topics and reports
//! project statistics. [`cache::TopicCache`] sits on top of it to avoid
//! repeated name lookups.

pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

use crate::auth::{summarize_error_body, AuthClient, AuthError};
use crate::config::Options;
use crate::retry::{retry_async, RetryPolicy};

pub const TOPICS_PATH: &str = "/v1/topics";
pub const TOPIC_NAMES_PATH: &str = "/v1/topics/names";
pub const TOPIC_EXISTS_PATH: &str = "/v1/topics/exists";
pub const INFO_PATH: &str = "/v1/info";
pub const STATUS_PATH: &str = "/v1/status";

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TopicsDefaults;

impl TopicsDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Clone, Debug)]
pub struct TopicsClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub page_size: u32,
}

impl Default for TopicsClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: TopicsDefaults::CONNECT_TIMEOUT,
            attempt_timeout: TopicsDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::api_default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TopicState {
    #[default]
    Undefined,
    Ready,
    Readonly,
    Deleting,
    Pending,
    Alerting,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub project_id: Option<Ulid>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub shards: u32,
    #[serde(default)]
    pub status: TopicState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicsPage {
    #[serde(default)]
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub next_page_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicName {
    pub topic_id: Ulid,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicNamesPage {
    #[serde(default)]
    pub topic_names: Vec<TopicName>,
    #[serde(default)]
    pub next_page_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicExists {
    #[serde(default)]
    pub query: String,
    pub exists: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TopicOperation {
    Archive,
    Destroy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicStatus {
    pub id: Ulid,
    pub state: TopicState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic_id: Option<Ulid>,
    #[serde(default)]
    pub events: u64,
    #[serde(default)]
    pub duplicates: u64,
    #[serde(default)]
    pub data_size_bytes: u64,
}

/// Project statistics, optionally filtered to some topics.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    #[serde(default)]
    pub project_id: Option<Ulid>,
    #[serde(default)]
    pub num_topics: u64,
    #[serde(default)]
    pub num_readonly_topics: u64,
    #[serde(default)]
    pub events: u64,
    #[serde(default)]
    pub duplicates: u64,
    #[serde(default)]
    pub data_size_bytes: u64,
    #[serde(default)]
    pub topics: Vec<TopicInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceState {
    pub status: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uptime: String,
}

#[derive(Debug, Error)]
pub enum TopicsError {
    #[error("invalid api url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error(transparent)]
    Credentials(#[from] AuthError),

    #[error("could not parse {0:?} as a topic id")]
    InvalidTopicId(String),

    #[error("topic {0:?} not found in project")]
    NotFound(String),
}

impl TopicsError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Credentials(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Name to id lookups the topic cache depends on.
#[async_trait]
pub trait TopicResolver: Send + Sync {
    async fn topic_exists(&self, name: &str) -> Result<bool, TopicsError>;
    async fn topic_id(&self, name: &str) -> Result<Ulid, TopicsError>;
    async fn create_topic(&self, name: &str) -> Result<Ulid, TopicsError>;
}

#[derive(Clone)]
pub struct TopicsClient {
    http: Client,
    base_url: String,
    auth: Option<Arc<AuthClient>>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    page_size: u32,
}

impl TopicsClient {
    pub fn new(base_url: &str, auth: Option<Arc<AuthClient>>) -> Result<Self, TopicsError> {
        Self::with_options(base_url, auth, TopicsClientOptions::default())
    }

    pub fn from_options(options: &Options, auth: Option<Arc<AuthClient>>) -> Result<Self, TopicsError> {
        Self::new(&options.http_base_url(), auth)
    }

    pub fn with_options(
        base_url: &str,
        auth: Option<Arc<AuthClient>>,
        options: TopicsClientOptions,
    ) -> Result<Self, TopicsError> {
        let parsed = reqwest::Url::parse(base_url).map_err(|err| TopicsError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TopicsError::InvalidUrl {
                url: base_url.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(TopicsError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            page_size: options.page_size.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Every topic in the project, fetching pages until the last one.
    pub async fn list_topics(&self) -> Result<Vec<Topic>, TopicsError> {
        let mut topics = Vec::new();
        let mut token = String::new();
        loop {
            let page: TopicsPage = self
                .request(Method::GET, TOPICS_PATH, &self.page_query(&token), None::<&()>)
                .await?;
            topics.extend(page.topics);
            if page.next_page_token.is_empty() {
                break;
            }
            token = page.next_page_token;
        }
        debug!(event = "topics_listed", count = topics.len());
        Ok(topics)
    }

    pub async fn create_topic(&self, name: &str) -> Result<Ulid, TopicsError> {
        #[derive(Serialize)]
        struct CreateTopic<'a> {
            name: &'a str,
        }

        let topic: Topic = self
            .request(Method::POST, TOPICS_PATH, &[], Some(&CreateTopic { name }))
            .await?;
        debug!(event = "topic_created", topic = %name, topic_id = %topic.id);
        Ok(topic.id)
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool, TopicsError> {
        let query = [("name", name.to_string())];
        let reply: TopicExists = self
            .request(Method::GET, TOPIC_EXISTS_PATH, &query, None::<&()>)
            .await?;
        Ok(reply.exists)
    }

    /// Looks up the id of the topic called `name`, walking the topic name
    /// pages until it is found.
    pub async fn topic_id(&self, name: &str) -> Result<Ulid, TopicsError> {
        let mut token = String::new();
        loop {
            let page: TopicNamesPage = self
                .request(Method::GET, TOPIC_NAMES_PATH, &self.page_query(&token), None::<&()>)
                .await?;
            if let Some(found) = page.topic_names.iter().find(|topic| topic.name == name) {
                return Ok(found.topic_id);
            }
            if page.next_page_token.is_empty() {
                return Err(TopicsError::NotFound(name.to_string()));
            }
            token = page.next_page_token;
        }
    }

    /// Marks the topic read-only.
    pub async fn archive_topic(&self, topic_id: &str) -> Result<TopicState, TopicsError> {
        self.modify_topic(topic_id, TopicOperation::Archive).await
    }

    /// Deletes the topic and all of its events.
    pub async fn destroy_topic(&self, topic_id: &str) -> Result<TopicState, TopicsError> {
        self.modify_topic(topic_id, TopicOperation::Destroy).await
    }

    /// Project statistics, limited to `topic_ids` when any are given.
    pub async fn info(&self, topic_ids: &[&str]) -> Result<ProjectInfo, TopicsError> {
        #[derive(Serialize)]
        struct InfoRequest {
            topics: Vec<Ulid>,
        }

        let topics = topic_ids
            .iter()
            .map(|topic_id| parse_topic_id(topic_id))
            .collect::<Result<Vec<_>, _>>()?;
        self.request(Method::POST, INFO_PATH, &[], Some(&InfoRequest { topics }))
            .await
    }

    pub async fn status(&self) -> Result<ServiceState, TopicsError> {
        self.request(Method::GET, STATUS_PATH, &[], None::<&()>).await
    }

    async fn modify_topic(
        &self,
        topic_id: &str,
        operation: TopicOperation,
    ) -> Result<TopicState, TopicsError> {
        #[derive(Serialize)]
        struct TopicMod {
            operation: TopicOperation,
        }

        let topic_id = parse_topic_id(topic_id)?;
        let path = format!("{TOPICS_PATH}/{topic_id}");
        let status: TopicStatus = self
            .request(Method::DELETE, &path, &[], Some(&TopicMod { operation }))
            .await?;
        debug!(
            event = "topic_modified",
            topic_id = %topic_id,
            ?operation,
            state = ?status.state
        );
        Ok(status.state)
    }

    fn page_query(&self, token: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![("page_size", self.page_size.to_string())];
        if !token.is_empty() {
            query.push(("next_page_token", token.to_string()));
        }
        query
    }

    async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, TopicsError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let endpoint = format!("{}{}", self.base_url, path);
        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                let method = method.clone();
                async move { self.send_attempt(method, &endpoint, query, body).await }
            },
            TopicsError::is_retryable,
        )
        .await
    }

    async fn send_attempt<B, T>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, TopicsError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(auth) = self.auth.as_ref() {
            builder = builder.header("authorization", auth.bearer().await?);
        }

        let response = builder.send().await.map_err(TopicsError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(TopicsError::Transport)?;
        if !status.is_success() {
            return Err(TopicsError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }
        serde_json::from_str(&text).map_err(|err| TopicsError::Parse(err.to_string()))
    }
}

#[async_trait]
impl TopicResolver for TopicsClient {
    async fn topic_exists(&self, name: &str) -> Result<bool, TopicsError> {
        TopicsClient::topic_exists(self, name).await
    }

    async fn topic_id(&self, name: &str) -> Result<Ulid, TopicsError> {
        TopicsClient::topic_id(self, name).await
    }

    async fn create_topic(&self, name: &str) -> Result<Ulid, TopicsError> {
        TopicsClient::create_topic(self, name).await
    }
}

fn parse_topic_id(topic_id: &str) -> Result<Ulid, TopicsError> {
    Ulid::from_string(topic_id.trim()).map_err(|_| TopicsError::InvalidTopicId(topic_id.to_string()))
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use ulid::Ulid;

    use super::{TopicState, TopicsClient, TopicsError, TopicsPage};

    #[test]
    fn rejects_non_http_base_urls() {
        assert!(matches!(
            TopicsClient::new("wss://ensign.example", None),
            Err(TopicsError::InvalidUrl { .. })
        ));
        let client = TopicsClient::new("https://ensign.example/", None).expect("client");
        assert_eq!(client.base_url(), "https://ensign.example");
    }

    #[test]
    fn retry_classification() {
        let server_error = TopicsError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let throttled = TopicsError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let conflict = TopicsError::HttpStatus {
            status: StatusCode::CONFLICT,
            body: String::new(),
        };
        assert!(server_error.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!conflict.is_retryable());
        assert!(!TopicsError::NotFound("orders".to_string()).is_retryable());
    }

    #[test]
    fn pages_decode_with_defaults() {
        let id = Ulid::new();
        let page: TopicsPage =
            serde_json::from_str(&format!(r#"{{"topics":[{{"id":"{id}","name":"orders"}}]}}"#))
                .expect("page");
        assert!(page.next_page_token.is_empty());
        assert_eq!(page.topics[0].id, id);
        assert_eq!(page.topics[0].status, TopicState::Undefined);
    }

    #[tokio::test]
    async fn info_validates_ids_before_any_request() {
        let client = TopicsClient::new("http://127.0.0.1:9", None).expect("client");
        let err = client.info(&["not-a-ulid"]).await.expect_err("invalid id");
        assert!(matches!(err, TopicsError::InvalidTopicId(id) if id == "not-a-ulid"));
    }
}
