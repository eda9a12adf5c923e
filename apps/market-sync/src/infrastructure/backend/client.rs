//! Dashboard backend HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::application::ports::{AuthError, Credentials, PollError, ResourceFetcher, TokenSource};
use crate::domain::state::ResourceKind;

const TOKEN_PATH: &str = "/api/auth/kite/token";
const LOGIN_PATH: &str = "/api/auth/kite/login";

/// Longest error body kept in a [`BackendError::Status`].
const MAX_ERROR_BODY: usize = 256;

// =============================================================================
// Errors
// =============================================================================

/// Backend request failure.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Build(String),

    /// Request could not be sent or the body not read.
    #[error("network error: {0}")]
    Network(String),

    /// Request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Body was not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl BackendError {
    fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<BackendError> for PollError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Status { status, .. } => Self::Status(status),
            BackendError::Decode(msg) => Self::Decode(msg),
            BackendError::Timeout => Self::Http("request timed out".to_string()),
            BackendError::Build(msg) | BackendError::Network(msg) => Self::Http(msg),
        }
    }
}

impl From<BackendError> for AuthError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Status { status: 404, body } => Self::Unavailable(body),
            BackendError::Decode(msg) => Self::Malformed(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Backend client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Base URL without trailing slash, e.g. `http://localhost:8000`.
    pub base_url: String,
    /// Whole-request timeout for auth calls. Poll requests are additionally
    /// bounded by the poller.
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct LoginResponse {
    login_url: String,
}

/// JSON client for the dashboard backend.
///
/// Implements both [`ResourceFetcher`] (the six polled resources) and
/// [`TokenSource`] (the Kite session endpoints).
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Build(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are made against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` and decode the body as JSON.
    ///
    /// An empty success body decodes as `null`.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, non-success status or a body that
    /// does not decode as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let url = format!("{}{path}", self.base_url);
        tracing::trace!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let body = if text.trim().is_empty() { "null" } else { &text };
        serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

fn status_error(status: StatusCode, body: &str) -> BackendError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect());

    BackendError::Status {
        status: status.as_u16(),
        body: detail,
    }
}

#[async_trait]
impl ResourceFetcher for BackendClient {
    async fn fetch(&self, kind: ResourceKind) -> Result<Value, PollError> {
        self.get_json(kind.path()).await.map_err(PollError::from)
    }
}

#[async_trait]
impl TokenSource for BackendClient {
    async fn fetch_credentials(&self) -> Result<Credentials, AuthError> {
        let token: TokenResponse = self.get_json(TOKEN_PATH).await?;

        let access_token = token
            .access_token
            .ok_or_else(|| AuthError::Malformed("missing access_token".to_string()))?;
        let api_key = token
            .api_key
            .ok_or_else(|| AuthError::Malformed("missing api_key".to_string()))?;

        Credentials::new(api_key, access_token)
    }

    async fn login_url(&self) -> Result<String, AuthError> {
        let login: LoginResponse = self.get_json(LOGIN_PATH).await?;
        Ok(login.login_url)
    }
}

// =============================================================================
// Tests
// =============================================================================
