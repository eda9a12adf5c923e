//! Auth Token Resolution
//!
//! Fetches transport credentials from the backend. There is no retry here:
//! the stream connection calls [`AuthTokenResolver::resolve`] once per
//! connect attempt, which picks up rotated tokens on reconnect.

use std::sync::Arc;

use crate::application::ports::{AuthError, Credentials, TokenSource};

/// Resolves credentials through a [`TokenSource`].
#[derive(Clone)]
pub struct AuthTokenResolver {
    source: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for AuthTokenResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokenResolver").finish_non_exhaustive()
    }
}

impl AuthTokenResolver {
    /// Create a resolver over a token source.
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }

    /// Fetch credentials for one connect attempt.
    ///
    /// # Errors
    ///
    /// Returns the source's error unchanged; the caller decides whether it
    /// disables the stream or counts as a failed attempt.
    pub async fn resolve(&self) -> Result<Credentials, AuthError> {
        match self.source.fetch_credentials().await {
            Ok(credentials) => {
                tracing::debug!(api_key = %credentials.api_key(), "Resolved stream credentials");
                Ok(credentials)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stream credentials unavailable");
                Err(e)
            }
        }
    }

    /// URL that starts the interactive login.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot produce one.
    pub async fn login_url(&self) -> Result<String, AuthError> {
        self.source.login_url().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct Rotating {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for Rotating {
        async fn fetch_credentials(&self) -> Result<Credentials, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(AuthError::Unavailable("not logged in".to_string()))
            } else {
                Credentials::new("key", format!("token-{n}"))
            }
        }

        async fn login_url(&self) -> Result<String, AuthError> {
            Ok("https://kite.zerodha.com/connect/login?v=3&api_key=key".to_string())
        }
    }

    #[tokio::test]
    async fn resolve_hits_source_every_time() {
        let source = Arc::new(Rotating {
            calls: AtomicUsize::new(0),
        });
        let resolver = AuthTokenResolver::new(source.clone());

        assert!(matches!(
            resolver.resolve().await,
            Err(AuthError::Unavailable(_))
        ));
        assert_eq!(resolver.resolve().await.unwrap().access_token(), "token-1");
        assert_eq!(resolver.resolve().await.unwrap().access_token(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn login_url_passes_through() {
        let resolver = AuthTokenResolver::new(Arc::new(Rotating {
            calls: AtomicUsize::new(0),
        }));

        let url = resolver.login_url().await.unwrap();
        assert!(url.contains("api_key=key"));
    }
}
