//! HTTP Surface
//!
//! Health checks, Prometheus metrics, the published state and the imperative
//! controls of the running [`StateCoordinator`].
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health summary
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (ready once a poll cycle has committed)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /state` - Latest `UnifiedState` as JSON
//! - `GET /login` - Interactive Kite login URL
//! - `GET /instruments` - Desired stream subscriptions
//! - `PUT /instruments/{id}` - Watch an instrument
//! - `DELETE /instruments/{id}` - Stop watching an instrument
//! - `POST /reconnect` - Reset the retry budget and reconnect the stream

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::AuthError;
use crate::application::services::StateCoordinator;
use crate::domain::market::Instrument;
use crate::domain::state::{ConnectionState, UnifiedState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Stream connection state.
    pub connection: ConnectionState,
    /// Last committed poll cycle (0 before the first commit).
    pub poll_cycle: u64,
    /// Published state revision.
    pub revision: u64,
    /// Desired subscription count.
    pub instruments: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Polled data present and the stream connected.
    Healthy,
    /// One of the two sources is missing.
    Degraded,
    /// Neither source has delivered anything.
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct InstrumentsResponse {
    instruments: Vec<Instrument>,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP handlers.
pub struct HttpServerState {
    version: String,
    started_at: Instant,
    coordinator: Arc<StateCoordinator>,
}

impl HttpServerState {
    /// Create handler state.
    #[must_use]
    pub fn new(version: String, coordinator: Arc<StateCoordinator>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            coordinator,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server for health, metrics, state and controls.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpServerState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server stops with
    /// an error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router without binding a socket.
#[must_use]
pub fn router(state: Arc<HttpServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/state", get(state_handler))
        .route("/login", get(login_handler))
        .route("/instruments", get(instruments_handler))
        .route(
            "/instruments/{id}",
            put(add_instrument_handler).delete(remove_instrument_handler),
        )
        .route("/reconnect", post(reconnect_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    if state.coordinator.snapshot().poll_cycle > 0 {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn state_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    let snapshot = state.coordinator.snapshot();
    match serde_json::to_vec::<UnifiedState>(&snapshot) {
        Ok(body) => (StatusCode::OK, [("content-type", "application/json")], body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize state");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string().into_bytes(),
            )
        }
    }
}

async fn login_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    match state.coordinator.login_url().await {
        Ok(login_url) => (StatusCode::OK, Json(json!({ "login_url": login_url }))),
        Err(e) => {
            let status = match e {
                AuthError::Backend(_) => StatusCode::BAD_GATEWAY,
                AuthError::Unavailable(_) | AuthError::Malformed(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            tracing::warn!(error = %e, "Login URL unavailable");
            (status, Json(json!({ "error": e.to_string() })))
        }
    }
}

async fn instruments_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    Json(InstrumentsResponse {
        instruments: state.coordinator.instruments(),
    })
}

async fn add_instrument_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.coordinator.add_instrument(Instrument::new(id));
    (
        StatusCode::ACCEPTED,
        Json(InstrumentsResponse {
            instruments: state.coordinator.instruments(),
        }),
    )
}

async fn remove_instrument_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.coordinator.remove_instrument(&Instrument::new(id));
    (
        StatusCode::ACCEPTED,
        Json(InstrumentsResponse {
            instruments: state.coordinator.instruments(),
        }),
    )
}

async fn reconnect_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    state.coordinator.reconnect();
    StatusCode::ACCEPTED
}

fn build_health_response(state: &HttpServerState) -> HealthResponse {
    let snapshot = state.coordinator.snapshot();
    let connected = snapshot.connection == ConnectionState::Connected;
    let polled = snapshot.poll_cycle > 0;

    HealthResponse {
        status: determine_health_status(polled, connected),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        connection: snapshot.connection,
        poll_cycle: snapshot.poll_cycle,
        revision: snapshot.revision,
        instruments: state.coordinator.instruments().len(),
    }
}

const fn determine_health_status(polled: bool, connected: bool) -> HealthStatus {
    match (polled, connected) {
        (true, true) => HealthStatus::Healthy,
        (false, false) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{
        Credentials, PollError, ResourceFetcher, StreamTransport, TokenSource, TransportError,
        TransportEvent,
    };
    use crate::application::services::CoordinatorConfig;
    use crate::domain::state::ResourceKind;

    struct BackendDown;

    #[async_trait]
    impl ResourceFetcher for BackendDown {
        async fn fetch(&self, _kind: ResourceKind) -> Result<Value, PollError> {
            Err(PollError::Status(503))
        }
    }

    struct LoggedOut;

    #[async_trait]
    impl TokenSource for LoggedOut {
        async fn fetch_credentials(&self) -> Result<Credentials, AuthError> {
            Err(AuthError::Unavailable("no session".to_string()))
        }

        async fn login_url(&self) -> Result<String, AuthError> {
            Ok("https://kite.zerodha.com/connect/login?v=3&api_key=key".to_string())
        }
    }

    struct Offline;

    #[async_trait]
    impl StreamTransport for Offline {
        async fn connect(
            &self,
            _credentials: &Credentials,
            _events: mpsc::Sender<TransportEvent>,
        ) -> Result<(), TransportError> {
            Err(TransportError::ConnectionFailed("offline".to_string()))
        }

        async fn subscribe(&self, _instruments: &[Instrument]) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn unsubscribe(&self, _instruments: &[Instrument]) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn disconnect(&self) {}
    }

    fn app() -> (Router, Arc<StateCoordinator>) {
        let coordinator = Arc::new(StateCoordinator::start(
            CoordinatorConfig::default(),
            Arc::new(BackendDown),
            Arc::new(LoggedOut),
            Arc::new(Offline),
        ));
        let state = Arc::new(HttpServerState::new(
            "test".to_string(),
            Arc::clone(&coordinator),
        ));
        (router(state), coordinator)
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn health_status_matrix() {
        assert_eq!(determine_health_status(true, true), HealthStatus::Healthy);
        assert_eq!(determine_health_status(true, false), HealthStatus::Degraded);
        assert_eq!(determine_health_status(false, true), HealthStatus::Degraded);
        assert_eq!(determine_health_status(false, false), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn liveness_is_ok() {
        let (app, coordinator) = app();
        let (status, body) = call(app, Method::GET, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn not_ready_without_committed_poll() {
        let (app, coordinator) = app();
        let (status, _) = call(app.clone(), Method::GET, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(app, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "unhealthy");
        assert_eq!(health["poll_cycle"], 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn state_is_served_as_json() {
        let (app, coordinator) = app();
        let (status, body) = call(app, Method::GET, "/state").await;
        assert_eq!(status, StatusCode::OK);

        let state: Value = serde_json::from_slice(&body).unwrap();
        assert!(state.get("connection").is_some());
        assert!(state.get("logs").is_some());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn login_url_is_proxied() {
        let (app, coordinator) = app();
        let (status, body) = call(app, Method::GET, "/login").await;
        assert_eq!(status, StatusCode::OK);

        let login: Value = serde_json::from_slice(&body).unwrap();
        assert!(
            login["login_url"]
                .as_str()
                .unwrap()
                .starts_with("https://kite.zerodha.com")
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn instruments_can_be_added_and_removed() {
        let (app, coordinator) = app();

        let (status, body) = call(app.clone(), Method::PUT, "/instruments/408065").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let listed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed["instruments"], json!(["408065"]));

        let (status, body) = call(app, Method::DELETE, "/instruments/408065").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let listed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed["instruments"], json!([]));

        assert!(coordinator.instruments().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_is_accepted() {
        let (app, coordinator) = app();
        let (status, _) = call(app, Method::POST, "/reconnect").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        coordinator.shutdown().await;
    }
}
