#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::panic
    )
)]

//! Market Sync - Real-time Dashboard State Engine
//!
//! Keeps one coherent, read-only view of commodity market state fed by two
//! sources of different speed: a REST polling loop against the dashboard
//! backend and the Kite ticker WebSocket stream.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure data and logic
//!   - `market`: Instruments, ticks, last-write-wins merging, forecasts
//!   - `signal`: Trading signal derivation from forecast medians
//!   - `state`: Poll snapshots and `UnifiedState` composition
//!   - `subscription`: Desired instrument set and connect replay
//!   - `log`: Bounded diagnostic log
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Stream transport, token source and resource fetcher traits
//!   - `services`: Polling, stream lifecycle, state coordination
//!
//! - **Infrastructure**: Adapters and process concerns
//!   - `backend`: reqwest client for the dashboard REST API
//!   - `kite`: Kite ticker WebSocket client and binary codec
//!   - `http`: Health, metrics, state and control endpoints
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Backend REST ──► PollingSynchronizer ──┐
//!                                        │   ┌──────────────────┐   watch
//!                                        ├──►│ StateCoordinator │──────────► Arc<UnifiedState>
//!                                        │   └──────────────────┘
//! Kite ticker ───► StreamConnection ─────┘         (single ingress queue)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core synchronization types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::log::{LOG_CAPACITY, LogBuffer, LogEntry, LogKind};
pub use domain::market::{
    Instrument, InstrumentMap, QuantileForecast, Tick, TickMerger, TickSnapshot,
};
pub use domain::signal::{InstrumentSignals, Signal, SignalThresholds};
pub use domain::state::{ConnectionState, MarketEntry, PollSnapshot, ResourceKind, UnifiedState};
pub use domain::subscription::{SubscriptionChanges, SubscriptionManager};

// Ports
pub use application::ports::{
    AuthError, Credentials, PollError, ResourceFetcher, StreamTransport, TokenSource,
    TransportError, TransportEvent,
};

// Services
pub use application::services::{
    CoordinatorConfig, PollingConfig, ReconnectConfig, StateCoordinator, SyncEvent,
};

// Adapters
pub use infrastructure::backend::{BackendClient, BackendConfig, BackendError};
pub use infrastructure::kite::{KiteTicker, KiteTickerConfig, TickMode};

// Configuration
pub use infrastructure::config::{ConfigError, PollProfile, SyncConfig};

// HTTP surface
pub use infrastructure::http::{HttpServer, HttpServerError, HttpServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
