//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the ports defined in the application layer,
//! plus the process-level concerns of the binary.

/// Dashboard backend REST client.
pub mod backend;

/// Configuration loaded from the environment.
pub mod config;

/// Health, metrics, state and control endpoints.
pub mod http;

/// Kite ticker WebSocket adapter.
pub mod kite;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry export.
pub mod telemetry;
