//! Authentication against the Ensign auth service.
//!
//! API keys are exchanged for a short-lived access token and a longer-lived
//! refresh token. Every stream open and REST call asks [`AuthClient`] for an
//! access token, which is refreshed or re-acquired on demand.

use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};

pub const AUTHENTICATE_PATH: &str = "/v1/authenticate";
pub const REFRESH_PATH: &str = "/v1/refresh";
pub const STATUS_PATH: &str = "/v1/status";

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthDefaults;

impl AuthDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct AuthClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for AuthClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: AuthDefaults::CONNECT_TIMEOUT,
            attempt_timeout: AuthDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::api_default(),
        }
    }
}

/// Client id and secret issued for a project.
#[derive(Clone)]
pub struct ApiKey {
    pub client_id: String,
    pub client_secret: SecretString,
}

impl ApiKey {
    pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }

    fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct Tokens {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
}

impl Tokens {
    fn is_empty(&self) -> bool {
        self.access_token.expose_secret().is_empty() || self.refresh_token.expose_secret().is_empty()
    }

    /// Whether the access token has not yet expired.
    pub fn access_valid(&self) -> Result<bool, AuthError> {
        let expires = expires_at(self.access_token.expose_secret())?;
        Ok(Utc::now() < expires)
    }

    /// Whether the refresh token is inside its `nbf`..`exp` window.
    pub fn refresh_valid(&self) -> Result<bool, AuthError> {
        let token = self.refresh_token.expose_secret();
        let now = Utc::now();
        let not_before = not_before(token)?;
        let expires = expires_at(token)?;
        Ok(now >= not_before && now < expires)
    }
}

/// Auth service health as reported by its status endpoint.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct AuthStatus {
    pub status: String,
    #[serde(default)]
    pub uptime: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("both client id and secret are required")]
    IncompleteCredentials,

    #[error("no api keys available: must login the client first")]
    NoApiKeys,

    #[error("invalid auth url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("auth request failed: {0}")]
    Transport(reqwest::Error),

    #[error("auth http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("could not parse token: {0}")]
    Token(String),

    #[error("failed to parse auth response: {0}")]
    Parse(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Holds API keys and tokens and hands out valid access tokens.
pub struct AuthClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    api_key: Mutex<Option<ApiKey>>,
    tokens: tokio::sync::Mutex<Option<Tokens>>,
}

impl AuthClient {
    pub fn new(auth_url: &str) -> Result<Self, AuthError> {
        Self::with_options(auth_url, AuthClientOptions::default())
    }

    pub fn with_options(auth_url: &str, options: AuthClientOptions) -> Result<Self, AuthError> {
        let parsed = reqwest::Url::parse(auth_url).map_err(|err| AuthError::InvalidUrl {
            url: auth_url.to_string(),
            reason: err.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(AuthError::InvalidUrl {
                url: auth_url.to_string(),
                reason: "url cannot be used as a base".to_string(),
            });
        }

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AuthError::Transport)?;

        Ok(Self {
            http,
            base_url: auth_url.trim_end_matches('/').to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            api_key: Mutex::new(None),
            tokens: tokio::sync::Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stores the API key and authenticates immediately.
    pub async fn login(
        &self,
        client_id: &str,
        client_secret: SecretString,
    ) -> Result<SecretString, AuthError> {
        let api_key = ApiKey::new(client_id, client_secret);
        if !api_key.is_complete() {
            return Err(AuthError::IncompleteCredentials);
        }

        let tokens = self.authenticate(&api_key).await?;
        self.set_api_key(api_key);

        let mut guard = self.tokens.lock().await;
        let access_token = tokens.access_token.clone();
        *guard = Some(tokens);
        Ok(access_token)
    }

    /// Returns a usable access token, refreshing or re-authenticating first
    /// when the cached one has expired.
    pub async fn access_token(&self) -> Result<SecretString, AuthError> {
        let mut guard = self.tokens.lock().await;

        let current = match guard.take() {
            Some(tokens) if !tokens.is_empty() => tokens,
            _ => self.authenticate_stored().await?,
        };

        let tokens = if current.access_valid()? {
            current
        } else if current.refresh_valid()? {
            debug!(event = "auth_refresh_tokens");
            self.refresh(&current).await?
        } else {
            debug!(event = "auth_reauthenticate");
            self.authenticate_stored().await?
        };

        let access_token = tokens.access_token.clone();
        *guard = Some(tokens);
        Ok(access_token)
    }

    /// `authorization` header value for the current access token.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        let token = self.access_token().await?;
        Ok(format!("Bearer {}", token.expose_secret()))
    }

    pub async fn authenticate(&self, api_key: &ApiKey) -> Result<Tokens, AuthError> {
        if !api_key.is_complete() {
            return Err(AuthError::NoApiKeys);
        }

        #[derive(Serialize, Clone)]
        struct AuthenticateRequest<'a> {
            client_id: &'a str,
            client_secret: &'a str,
        }

        let request = AuthenticateRequest {
            client_id: &api_key.client_id,
            client_secret: api_key.client_secret.expose_secret(),
        };
        let reply: TokensReply = self.post(AUTHENTICATE_PATH, &request).await?;
        Ok(reply.into_tokens())
    }

    pub async fn refresh(&self, tokens: &Tokens) -> Result<Tokens, AuthError> {
        #[derive(Serialize, Clone)]
        struct RefreshRequest<'a> {
            access_token: &'a str,
            refresh_token: &'a str,
        }

        let request = RefreshRequest {
            access_token: tokens.access_token.expose_secret(),
            refresh_token: tokens.refresh_token.expose_secret(),
        };
        let reply: TokensReply = self.post(REFRESH_PATH, &request).await?;
        Ok(reply.into_tokens())
    }

    pub async fn status(&self) -> Result<AuthStatus, AuthError> {
        let endpoint = format!("{}{}", self.base_url, STATUS_PATH);
        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let response = self
                        .http
                        .get(&endpoint)
                        .timeout(self.attempt_timeout)
                        .send()
                        .await
                        .map_err(AuthError::Transport)?;
                    read_json(response).await
                }
            },
            AuthError::is_retryable,
        )
        .await
    }

    pub async fn set_tokens(&self, tokens: Tokens) {
        *self.tokens.lock().await = Some(tokens);
    }

    /// Forgets the API key and any cached tokens.
    pub async fn reset(&self) {
        if let Ok(mut guard) = self.api_key.lock() {
            *guard = None;
        }
        *self.tokens.lock().await = None;
    }

    fn set_api_key(&self, api_key: ApiKey) {
        if let Ok(mut guard) = self.api_key.lock() {
            *guard = Some(api_key);
        }
    }

    async fn authenticate_stored(&self) -> Result<Tokens, AuthError> {
        let api_key = self
            .api_key
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(AuthError::NoApiKeys)?;
        self.authenticate(&api_key).await
    }

    async fn post<Req, Rep>(&self, path: &str, request: &Req) -> Result<Rep, AuthError>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let endpoint = format!("{}{}", self.base_url, path);
        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let response = self
                        .http
                        .post(&endpoint)
                        .timeout(self.attempt_timeout)
                        .json(request)
                        .send()
                        .await
                        .map_err(AuthError::Transport)?;
                    read_json(response).await
                }
            },
            AuthError::is_retryable,
        )
        .await
    }
}

#[derive(Deserialize)]
struct TokensReply {
    access_token: String,
    refresh_token: String,
}

impl TokensReply {
    fn into_tokens(self) -> Tokens {
        Tokens {
            access_token: SecretString::new(self.access_token),
            refresh_token: SecretString::new(self.refresh_token),
        }
    }
}

async fn read_json<Rep: DeserializeOwned>(response: reqwest::Response) -> Result<Rep, AuthError> {
    let status = response.status();
    let body = response.text().await.map_err(AuthError::Transport)?;
    if !status.is_success() {
        return Err(AuthError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    serde_json::from_str(&body).map_err(|err| AuthError::Parse(err.to_string()))
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
}

/// Reads the claims of a JWT without verifying its signature.
fn parse_claims(token: &str) -> Result<Claims, AuthError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Token("token is not a three part jwt".to_string()));
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| AuthError::Token(err.to_string()))?;
    serde_json::from_slice(&decoded).map_err(|err| AuthError::Token(err.to_string()))
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, AuthError> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| AuthError::Token(format!("timestamp {seconds} out of range")))
}

pub fn expires_at(token: &str) -> Result<DateTime<Utc>, AuthError> {
    let claims = parse_claims(token)?;
    let exp = claims
        .exp
        .ok_or_else(|| AuthError::Token("token has no exp claim".to_string()))?;
    timestamp(exp)
}

pub fn not_before(token: &str) -> Result<DateTime<Utc>, AuthError> {
    let claims = parse_claims(token)?;
    let nbf = claims
        .nbf
        .ok_or_else(|| AuthError::Token("token has no nbf claim".to_string()))?;
    timestamp(nbf)
}
