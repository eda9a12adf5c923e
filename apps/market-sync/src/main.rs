//! Market Sync Binary
//!
//! Runs the synchronization engine against the dashboard backend and the
//! Kite ticker, and serves the HTTP surface.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-sync
//! ```
//!
//! # Environment Variables
//!
//! - `SYNC_BACKEND_URL`: Dashboard backend (default: <http://localhost:8000>)
//! - `SYNC_POLL_PROFILE`: dashboard | digest (default: dashboard)
//! - `SYNC_POLL_INTERVAL_SECS`: Overrides the profile interval
//! - `SYNC_REQUEST_TIMEOUT_MS`: Per-request timeout (default: 4000)
//! - `SYNC_RESOURCES`: Comma-separated resources to poll (default: all)
//! - `SYNC_INSTRUMENTS`: Comma-separated initial subscriptions
//! - `SYNC_INSTRUMENT_ALIASES`: `token:market_key` pairs
//! - `KITE_TICKER_URL`: Ticker endpoint (default: wss://ws.kite.trade)
//! - `KITE_TICK_MODE`: ltp | quote | full (default: quote)
//! - `SYNC_RECONNECT_MAX_ATTEMPTS`: Retry budget, 0 = unlimited (default: 10)
//! - `SYNC_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 5000)
//! - `SYNC_RECONNECT_DELAY_MAX_SECS`: Backoff ceiling (default: 60)
//! - `SYNC_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `SYNC_STREAM_IDLE_TIMEOUT_SECS`: Silent stream drop threshold (default: 10)
//! - `SYNC_HTTP_PORT`: HTTP surface port (default: 8090)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_sync::infrastructure::telemetry;
use market_sync::{
    BackendClient, HttpServer, HttpServerState, KiteTicker, StateCoordinator, SyncConfig,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Upper bound on coordinator teardown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Market Sync");

    let _metrics_handle = init_metrics();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let backend = Arc::new(
        BackendClient::new(&config.backend).context("failed to build backend client")?,
    );
    let ticker = Arc::new(KiteTicker::new(config.ticker.clone()));

    let coordinator = Arc::new(StateCoordinator::start(
        config.coordinator(),
        backend.clone(),
        backend,
        ticker,
    ));

    let shutdown_token = CancellationToken::new();
    let http_state = Arc::new(HttpServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&coordinator),
    ));
    let http_server = HttpServer::new(config.server.http_port, http_state, shutdown_token.clone());
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Market sync ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, coordinator.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Coordinator shutdown timed out"
        );
    }
    if let Err(e) = http_task.await {
        tracing::warn!(error = %e, "HTTP task ended abnormally");
    }

    tracing::info!("Market sync stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        backend = %config.backend.base_url,
        profile = config.profile.as_str(),
        interval_secs = config.polling.interval.as_secs(),
        resources = config.polling.resources.len(),
        instruments = config.instruments.len(),
        http_port = config.server.http_port,
        "Configuration loaded"
    );
    tracing::debug!(
        ticker_url = %config.ticker.url,
        mode = config.ticker.mode.as_str(),
        max_attempts = config.reconnect.max_attempts,
        aliases = config.aliases.len(),
        "Stream settings"
    );
}

/// Load .env from the current directory or the nearest ancestor that has one.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let Ok(cwd) = std::env::current_dir() else {
        return;
    };
    if let Some(path) = cwd
        .ancestors()
        .skip(1)
        .map(|dir| dir.join(".env"))
        .find(|path| path.exists())
    {
        let _ = dotenvy::from_path(&path);
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
