//! Port Interfaces
//!
//! Contracts the infrastructure adapters implement, following the Hexagonal
//! Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`StreamTransport`]: persistent push connection delivering ticks
//! - [`TokenSource`]: transport credentials and the login hand-off
//! - [`ResourceFetcher`]: one REST resource per call

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::market::{Instrument, Tick};
use crate::domain::state::ResourceKind;

// =============================================================================
// Credentials
// =============================================================================

/// Transport credentials handed out by the backend after login.
///
/// The `Debug` implementation redacts the access token for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    access_token: String,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Malformed`] if either field is empty.
    pub fn new(api_key: impl Into<String>, access_token: impl Into<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into();
        let access_token = access_token.into();

        if api_key.trim().is_empty() {
            return Err(AuthError::Malformed("api_key is empty".to_string()));
        }
        if access_token.trim().is_empty() {
            return Err(AuthError::Malformed("access_token is empty".to_string()));
        }

        Ok(Self {
            api_key,
            access_token,
        })
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Credentials could not be obtained.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No session exists yet (the user has not logged in).
    #[error("credentials unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something that is not usable credentials.
    #[error("malformed credentials: {0}")]
    Malformed(String),

    /// The backend could not be reached.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Push transport failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Operation needs an open connection.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    Closed,

    /// Frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Single resource fetch failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    /// Request could not be sent or the body not read.
    #[error("request failed: {0}")]
    Http(String),

    /// Non-success HTTP status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// Body was not valid JSON.
    #[error("invalid body: {0}")]
    Decode(String),

    /// No answer within the request timeout.
    #[error("timed out after {0}ms")]
    Timeout(u64),
}

// =============================================================================
// Stream Transport
// =============================================================================

/// Event reported by a [`StreamTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established and ready for subscriptions.
    Connected,
    /// A batch of ticks decoded from one frame.
    Ticks(Vec<Tick>),
    /// Connection dropped. Recoverable.
    Disconnected {
        /// Why the connection ended.
        reason: String,
    },
    /// Unrecoverable fault on the current connection.
    Error(String),
}

/// Persistent push connection delivering ticks.
///
/// `connect` starts a session whose events arrive on `events`. A session
/// always ends with exactly one `Disconnected` or `Error` event unless it is
/// closed with [`StreamTransport::disconnect`].
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails; no events are sent then.
    async fn connect(
        &self,
        credentials: &Credentials,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Subscribe to instruments on the open session.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is open or the request fails.
    async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), TransportError>;

    /// Unsubscribe from instruments on the open session.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is open or the request fails.
    async fn unsubscribe(&self, instruments: &[Instrument]) -> Result<(), TransportError>;

    /// Close the session, if any. Idempotent.
    async fn disconnect(&self);
}

// =============================================================================
// Token Source
// =============================================================================

/// Source of transport credentials.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch the current credentials.
    ///
    /// # Errors
    ///
    /// Returns an error when no usable credentials exist.
    async fn fetch_credentials(&self) -> Result<Credentials, AuthError>;

    /// URL that starts the interactive login.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot produce one.
    async fn login_url(&self) -> Result<String, AuthError>;
}

// =============================================================================
// Resource Fetcher
// =============================================================================

/// Fetches one polled REST resource.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch a resource payload.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-success status, or an
    /// unparsable body.
    async fn fetch(&self, kind: ResourceKind) -> Result<Value, PollError>;
}
