//! Client options, environment loading and validation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

pub const ENV_CLIENT_ID: &str = "ENSIGN_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "ENSIGN_CLIENT_SECRET";
pub const ENV_ENDPOINT: &str = "ENSIGN_ENDPOINT";
pub const ENV_INSECURE: &str = "ENSIGN_INSECURE";
pub const ENV_AUTH_URL: &str = "ENSIGN_AUTH_URL";
pub const ENV_NO_AUTHENTICATION: &str = "ENSIGN_NO_AUTHENTICATION";

/// Production Ensign node (`host:port`).
pub const ENSIGN_ENDPOINT: &str = "ensign.rotational.app:443";
/// Production auth service.
pub const AUTH_ENDPOINT: &str = "https://auth.rotational.app";

const KEY_CLIENT_ID: &str = "ClientID";
const KEY_CLIENT_SECRET: &str = "ClientSecret";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid options: endpoint is required")]
    MissingEndpoint,

    #[error("invalid options: client ID is required")]
    MissingClientId,

    #[error("invalid options: client secret is required")]
    MissingClientSecret,

    #[error("invalid options: auth url is required")]
    MissingAuthUrl,

    #[error("could not read credentials file {path}: {source}")]
    CredentialsIo {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse credentials file {path}: {source}")]
    CredentialsJson {
        path: String,
        source: serde_json::Error,
    },
}

/// Tuning for the publish and subscribe stream managers.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Bound on opening a stream and completing its handshake.
    pub handshake_timeout: Duration,
    /// How long a broken stream waits for the connection to recover.
    pub reconnect_timeout: Duration,
    /// How long `close` waits for background tasks before aborting them.
    pub close_timeout: Duration,
    /// Capacity of the subscriber's event channel.
    pub buffer_size: usize,
}

impl StreamOptions {
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const BUFFER_SIZE: usize = 128;
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Self::HANDSHAKE_TIMEOUT,
            reconnect_timeout: Self::RECONNECT_TIMEOUT,
            close_timeout: Self::CLOSE_TIMEOUT,
            buffer_size: Self::BUFFER_SIZE,
        }
    }
}

/// Connection and credential settings for [`crate::Client`].
///
/// Unset fields are filled from the environment and then from the production
/// defaults when [`Options::validate`] runs.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    /// `host:port` of the Ensign node.
    pub endpoint: String,
    /// Use plaintext `ws://`/`http://` instead of TLS.
    pub insecure: bool,
    pub auth_url: String,
    pub no_authentication: bool,
    pub stream: StreamOptions,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options populated from `ENSIGN_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.apply_env(|key| std::env::var(key).ok());
        options
    }

    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = client_id.into();
        self.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Loads `ClientID`/`ClientSecret` from a downloaded JSON credentials file.
    ///
    /// Missing or empty keys leave the current values untouched.
    pub fn with_load_credentials(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::CredentialsIo {
            path: display.clone(),
            source,
        })?;
        let data: HashMap<String, serde_json::Value> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::CredentialsJson {
                path: display,
                source,
            })?;

        if let Some(client_id) = non_empty_str(&data, KEY_CLIENT_ID) {
            self.client_id = client_id.to_string();
        }
        if let Some(secret) = non_empty_str(&data, KEY_CLIENT_SECRET) {
            self.client_secret = Some(SecretString::new(secret.to_string()));
        }
        Ok(self)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, insecure: bool) -> Self {
        self.endpoint = endpoint.into().trim().to_string();
        self.insecure = insecure;
        self
    }

    pub fn with_authenticator(mut self, auth_url: impl Into<String>, no_authentication: bool) -> Self {
        self.auth_url = auth_url.into().trim().to_string();
        self.no_authentication = no_authentication;
        self
    }

    pub fn with_stream_options(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }

    /// Fills unset fields from the environment and defaults, then checks that
    /// the required ones are present.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok());
        self.apply_defaults();
        self.check()
    }

    /// Base URL for stream websockets, e.g. `wss://host:443`.
    pub fn ws_base_url(&self) -> String {
        let scheme = if self.insecure { "ws" } else { "wss" };
        format!("{scheme}://{}", self.endpoint)
    }

    /// Base URL for the REST API, e.g. `https://host:443`.
    pub fn http_base_url(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{}", self.endpoint)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if self.client_id.is_empty() {
            if let Some(client_id) = lookup(ENV_CLIENT_ID) {
                self.client_id = client_id;
            }
        }
        if self.client_secret.is_none() {
            if let Some(secret) = lookup(ENV_CLIENT_SECRET) {
                self.client_secret = Some(SecretString::new(secret));
            }
        }
        if self.endpoint.is_empty() {
            if let Some(endpoint) = lookup(ENV_ENDPOINT) {
                self.endpoint = endpoint.trim().to_string();
                self.insecure = parse_bool(lookup(ENV_INSECURE).as_deref(), self.insecure);
            }
        }
        if self.auth_url.is_empty() {
            if let Some(auth_url) = lookup(ENV_AUTH_URL) {
                self.auth_url = auth_url.trim().to_string();
            }
        }
        if !self.no_authentication {
            self.no_authentication = parse_bool(lookup(ENV_NO_AUTHENTICATION).as_deref(), false);
        }
    }

    fn apply_defaults(&mut self) {
        if self.endpoint.is_empty() {
            self.endpoint = ENSIGN_ENDPOINT.to_string();
        }
        if self.auth_url.is_empty() && !self.no_authentication {
            self.auth_url = AUTH_ENDPOINT.to_string();
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.no_authentication {
            return Ok(());
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        let has_secret = self
            .client_secret
            .as_ref()
            .is_some_and(|secret| !secret.expose_secret().is_empty());
        if !has_secret {
            return Err(ConfigError::MissingClientSecret);
        }
        if self.auth_url.is_empty() {
            return Err(ConfigError::MissingAuthUrl);
        }
        Ok(())
    }
}

fn non_empty_str<'a>(data: &'a HashMap<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|value| !value.is_empty())
}

/// Lenient boolean parsing; unrecognized or missing values keep `default`.
pub fn parse_bool(value: Option<&str>, default: bool) -> bool {
    let Some(value) = value else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "t" | "yes" | "true" | "on" => true,
        "0" | "n" | "f" | "no" | "false" | "off" => false,
        _ => default,
    }
}
