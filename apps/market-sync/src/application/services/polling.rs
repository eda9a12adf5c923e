//! Polling Synchronizer
//!
//! Fetches every configured REST resource concurrently on a fixed interval.
//! A cycle commits only if every fetch succeeds; otherwise nothing from that
//! cycle is kept and the failure is reported instead. Late ticks are skipped,
//! never bursted.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{PollError, ResourceFetcher};
use crate::domain::state::{PollSnapshot, ResourceKind};
use crate::infrastructure::metrics::{self, PollOutcome};

use super::events::SyncEvent;

/// Interactive dashboard poll interval.
pub const DASHBOARD_INTERVAL: Duration = Duration::from_secs(5);

/// Digest poll interval.
pub const DIGEST_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// Polling cadence and resource list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    /// Time between cycle starts.
    pub interval: Duration,
    /// Per-request timeout. Kept shorter than `interval`.
    pub request_timeout: Duration,
    /// Resources fetched each cycle.
    pub resources: Vec<ResourceKind>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: DASHBOARD_INTERVAL,
            request_timeout: Duration::from_millis(4000),
            resources: ResourceKind::all().to_vec(),
        }
    }
}

// =============================================================================
// Failure
// =============================================================================

/// A poll cycle in which at least one resource failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("poll cycle {cycle} failed: {}", summarize(.failures))]
pub struct PollFailure {
    /// Cycle number.
    pub cycle: u64,
    /// Every resource that failed, with its error.
    pub failures: Vec<(ResourceKind, PollError)>,
}

fn summarize(failures: &[(ResourceKind, PollError)]) -> String {
    let mut out = String::new();
    for (i, (kind, error)) in failures.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{kind}: {error}");
    }
    out
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Periodic all-or-nothing multi-resource fetch.
pub struct PollingSynchronizer {
    fetcher: Arc<dyn ResourceFetcher>,
    config: PollingConfig,
    cycle: u64,
}

impl PollingSynchronizer {
    /// Create a synchronizer.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, config: PollingConfig) -> Self {
        Self {
            fetcher,
            config,
            cycle: 0,
        }
    }

    /// Number of cycles started so far.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run one cycle.
    ///
    /// # Errors
    ///
    /// Returns [`PollFailure`] listing every resource that failed. No partial
    /// snapshot is produced.
    pub async fn tick(&mut self) -> Result<PollSnapshot, PollFailure> {
        self.cycle += 1;
        let cycle = self.cycle;
        let started = Instant::now();
        let timeout = self.config.request_timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let fetcher = &self.fetcher;

        let fetches = self.config.resources.iter().map(|&kind| async move {
            let result = match tokio::time::timeout(timeout, fetcher.fetch(kind)).await {
                Ok(result) => result,
                Err(_) => Err(PollError::Timeout(timeout_ms)),
            };
            (kind, result)
        });

        let mut resources = BTreeMap::new();
        let mut failures = Vec::new();
        for (kind, result) in join_all(fetches).await {
            match result {
                Ok(payload) => {
                    resources.insert(kind, payload);
                }
                Err(error) => {
                    metrics::record_poll_resource_failure(kind);
                    failures.push((kind, error));
                }
            }
        }

        if failures.is_empty() {
            metrics::record_poll_cycle(PollOutcome::Committed, started.elapsed());
            tracing::debug!(cycle, resources = resources.len(), "Poll cycle committed");
            Ok(PollSnapshot::new(cycle, resources))
        } else {
            metrics::record_poll_cycle(PollOutcome::Failed, started.elapsed());
            let failure = PollFailure { cycle, failures };
            tracing::warn!(error = %failure, "Poll cycle discarded");
            Err(failure)
        }
    }

    /// Poll on the configured interval until cancelled.
    ///
    /// The first cycle runs immediately.
    pub async fn run(mut self, ingress: mpsc::Sender<SyncEvent>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = self.config.interval.as_millis(),
            resources = self.config.resources.len(),
            "Polling started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };

            let event = match outcome {
                Ok(snapshot) => SyncEvent::PollCommitted(snapshot),
                Err(failure) => SyncEvent::PollFailed(failure),
            };
            if ingress.send(event).await.is_err() {
                break;
            }
        }

        tracing::info!(cycles = self.cycle, "Polling stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
