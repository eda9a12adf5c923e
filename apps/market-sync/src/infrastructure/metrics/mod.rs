//! Prometheus Metrics Module
//!
//! Exposes synchronization metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Live ticks and tick batches received
//! - **Polling**: Poll cycles by outcome, per-resource failures, cycle latency
//! - **Connection**: Stream state, reconnect attempts, budget exhaustion
//! - **State**: Published revisions and desired subscriptions
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP port. Recording before
//! [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::state::{ConnectionState, ResourceKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_sync_ticks_received_total",
        "Total live ticks received from the stream"
    );
    describe_counter!(
        "market_sync_tick_batches_total",
        "Total tick batches forwarded to the coordinator"
    );
    describe_counter!(
        "market_sync_frame_errors_total",
        "Total stream frames that could not be decoded"
    );

    describe_counter!(
        "market_sync_poll_cycles_total",
        "Total poll cycles by outcome"
    );
    describe_counter!(
        "market_sync_poll_resource_failures_total",
        "Total failed resource fetches by resource"
    );
    describe_histogram!(
        "market_sync_poll_cycle_seconds",
        "Wall time of one poll cycle"
    );

    describe_gauge!(
        "market_sync_connection_state",
        "Stream state: 0 idle, 1 connecting, 2 connected, 3 disconnected, 4 errored"
    );
    describe_counter!(
        "market_sync_reconnects_total",
        "Total scheduled reconnect attempts"
    );
    describe_counter!(
        "market_sync_reconnect_exhausted_total",
        "Times the reconnect budget was spent"
    );

    describe_gauge!(
        "market_sync_desired_subscriptions",
        "Instruments in the desired subscription set"
    );
    describe_counter!(
        "market_sync_state_revisions_total",
        "Total unified states published"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for poll cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every resource fetched and committed.
    Committed,
    /// At least one resource failed; nothing committed.
    Failed,
}

impl PollOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

/// Record a tick batch forwarded from the stream.
pub fn record_tick_batch(ticks: usize) {
    counter!("market_sync_tick_batches_total").increment(1);
    counter!("market_sync_ticks_received_total")
        .increment(u64::try_from(ticks).unwrap_or(u64::MAX));
}

/// Record an undecodable stream frame.
pub fn record_frame_error(error_type: &str) {
    counter!(
        "market_sync_frame_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a finished poll cycle.
pub fn record_poll_cycle(outcome: PollOutcome, duration: Duration) {
    counter!(
        "market_sync_poll_cycles_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("market_sync_poll_cycle_seconds").record(duration.as_secs_f64());
}

/// Record one failed resource fetch.
pub fn record_poll_resource_failure(resource: ResourceKind) {
    counter!(
        "market_sync_poll_resource_failures_total",
        "resource" => resource.as_str()
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("market_sync_connection_state").set(f64::from(state.code()));
}

/// Record a scheduled reconnect attempt.
pub fn record_reconnect() {
    counter!("market_sync_reconnects_total").increment(1);
}

/// Record that the reconnect budget was spent.
pub fn record_reconnect_exhausted() {
    counter!("market_sync_reconnect_exhausted_total").increment(1);
}

/// Update the desired subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_desired_subscriptions(count: usize) {
    gauge!("market_sync_desired_subscriptions").set(count as f64);
}

/// Record a published state.
pub fn record_state_published() {
    counter!("market_sync_state_revisions_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
