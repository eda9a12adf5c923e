//! State Coordinator
//!
//! Sole owner and writer of [`UnifiedState`]. The polling loop and the stream
//! connection report deltas over one ingress queue; the coordinator applies
//! everything that is ready, composes one new state, and publishes it as a
//! single reference replacement on a `watch` channel.
//!
//! # Data Flow
//!
//! ```text
//! PollingSynchronizer ──┐
//!                       ├──► ingress (mpsc) ──► CoordinatorState ──► watch<Arc<UnifiedState>>
//! StreamConnection ─────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AuthError, ResourceFetcher, StreamTransport, TokenSource};
use crate::domain::log::{LogBuffer, LogKind};
use crate::domain::market::{Instrument, InstrumentMap, TickMerger, TickSnapshot};
use crate::domain::state::{
    ComposeInput, ConnectionState, PollSnapshot, ResourceKind, UnifiedState, compose,
    latest_forecasts,
};
use crate::domain::subscription::SubscriptionManager;
use crate::infrastructure::metrics;

use super::auth::AuthTokenResolver;
use super::events::SyncEvent;
use super::polling::{PollingConfig, PollingSynchronizer};
use super::reconnect::ReconnectConfig;
use super::stream::{StreamConnection, StreamHandle};

/// Default ingress queue depth.
pub const DEFAULT_INGRESS_CAPACITY: usize = 4096;

// =============================================================================
// Configuration
// =============================================================================

/// Everything needed to start a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Poll cadence and resources.
    pub polling: PollingConfig,
    /// Stream retry policy.
    pub reconnect: ReconnectConfig,
    /// Stream token to market key bridge.
    pub aliases: InstrumentMap,
    /// Instruments subscribed from the start.
    pub instruments: Vec<Instrument>,
    /// Ingress queue depth.
    pub ingress_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            reconnect: ReconnectConfig::default(),
            aliases: InstrumentMap::new(),
            instruments: Vec::new(),
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
        }
    }
}

// =============================================================================
// Coordinator State
// =============================================================================

/// Mutable inputs to composition. Owned by the ingress task.
#[derive(Debug, Default)]
pub struct CoordinatorState {
    poll: PollSnapshot,
    ticks: TickSnapshot,
    aliases: InstrumentMap,
    connection: ConnectionState,
    logs: LogBuffer,
    revision: u64,
    poll_failing: bool,
}

impl CoordinatorState {
    /// Create state with an alias map.
    #[must_use]
    pub fn new(aliases: InstrumentMap) -> Self {
        Self {
            aliases,
            ..Self::default()
        }
    }

    /// Apply one event. Returns whether the published view changes.
    pub fn apply(&mut self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::PollCommitted(snapshot) => {
                let predictions = snapshot.value_or_null(ResourceKind::Predictions);
                for (instrument, forecast) in latest_forecasts(&predictions) {
                    if let Some(forecast) = forecast.filter(|f| !f.is_ordered()) {
                        tracing::warn!(
                            %instrument,
                            p05 = forecast.p05,
                            p50 = forecast.p50,
                            p95 = forecast.p95,
                            "Forecast quantiles out of order"
                        );
                    }
                }
                if self.poll_failing {
                    self.poll_failing = false;
                    self.logs.append("Backend polling recovered", LogKind::Success);
                }
                self.poll = snapshot;
                true
            }
            SyncEvent::PollFailed(failure) => {
                self.poll_failing = true;
                self.logs.append(failure.to_string(), LogKind::Alert);
                true
            }
            SyncEvent::Ticks(batch) => {
                if batch.is_empty() {
                    return false;
                }
                self.ticks = TickMerger::apply(&self.ticks, &batch);
                true
            }
            SyncEvent::Unwatched(instrument) => {
                let next = TickMerger::evict(&self.ticks, &instrument);
                let changed = !next.ptr_eq(&self.ticks);
                self.ticks = next;
                changed
            }
            SyncEvent::Connection(state) => {
                let changed = self.connection != state;
                self.connection = state;
                changed
            }
            SyncEvent::Log { message, kind } => {
                self.logs.append(message, kind);
                true
            }
        }
    }

    /// Compose the next published state, bumping the revision.
    pub fn publish(&mut self) -> UnifiedState {
        self.revision += 1;
        self.compose()
    }

    /// Compose without bumping the revision.
    #[must_use]
    pub fn compose(&self) -> UnifiedState {
        compose(ComposeInput {
            poll: &self.poll,
            ticks: &self.ticks,
            aliases: &self.aliases,
            connection: self.connection,
            logs: &self.logs,
            revision: self.revision,
        })
    }
}

/// Apply every ready event, then publish once per batch.
async fn run_ingress(
    mut state: CoordinatorState,
    mut ingress: mpsc::Receiver<SyncEvent>,
    publisher: watch::Sender<Arc<UnifiedState>>,
    stop: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            event = ingress.recv() => match event {
                Some(event) => event,
                None => break,
            },
            () = stop.cancelled() => break,
        };

        let mut changed = state.apply(first);
        while let Ok(event) = ingress.try_recv() {
            changed |= state.apply(event);
        }

        if changed {
            publisher.send_replace(Arc::new(state.publish()));
            metrics::record_state_published();
        }
    }

    let mut changed = false;
    while let Ok(event) = ingress.try_recv() {
        changed |= state.apply(event);
    }
    if changed {
        publisher.send_replace(Arc::new(state.publish()));
        metrics::record_state_published();
    }
}

// =============================================================================
// State Coordinator
// =============================================================================

struct Tasks {
    ingress: JoinHandle<()>,
    polling: JoinHandle<()>,
    stream: JoinHandle<()>,
}

/// Running synchronization engine.
///
/// Construct with [`StateCoordinator::start`] inside a Tokio runtime and tear
/// down with [`StateCoordinator::shutdown`]. Dropping without shutdown
/// cancels the background tasks without waiting for them.
pub struct StateCoordinator {
    state: watch::Receiver<Arc<UnifiedState>>,
    subscriptions: Arc<SubscriptionManager>,
    stream: StreamHandle,
    resolver: AuthTokenResolver,
    ingress: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
    ingress_stop: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl StateCoordinator {
    /// Start polling, the stream connection and the ingress task.
    #[must_use]
    pub fn start(
        config: CoordinatorConfig,
        fetcher: Arc<dyn ResourceFetcher>,
        tokens: Arc<dyn TokenSource>,
        transport: Arc<dyn StreamTransport>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let ingress_stop = CancellationToken::new();
        let (ingress_tx, ingress_rx) = mpsc::channel(config.ingress_capacity.max(1));

        let coordinator_state = CoordinatorState::new(config.aliases);
        let (publisher, state) = watch::channel(Arc::new(coordinator_state.compose()));

        let subscriptions = Arc::new(SubscriptionManager::with_instruments(config.instruments));
        metrics::set_desired_subscriptions(subscriptions.len());
        metrics::set_connection_state(ConnectionState::Idle);

        let resolver = AuthTokenResolver::new(tokens);
        let (connection, stream) = StreamConnection::new(
            transport,
            resolver.clone(),
            Arc::clone(&subscriptions),
            config.reconnect,
            ingress_tx.clone(),
            cancel.clone(),
        );
        let poller = PollingSynchronizer::new(fetcher, config.polling);

        let tasks = Tasks {
            ingress: tokio::spawn(run_ingress(
                coordinator_state,
                ingress_rx,
                publisher,
                ingress_stop.clone(),
            )),
            polling: tokio::spawn(poller.run(ingress_tx.clone(), cancel.clone())),
            stream: tokio::spawn(connection.run()),
        };

        tracing::info!(
            instruments = subscriptions.len(),
            "State coordinator started"
        );

        Self {
            state,
            subscriptions,
            stream,
            resolver,
            ingress: ingress_tx,
            cancel,
            ingress_stop,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    /// Receiver that always holds the latest published state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<UnifiedState>> {
        self.state.clone()
    }

    /// Published states as a stream, starting with the current one.
    #[must_use]
    pub fn state_stream(&self) -> WatchStream<Arc<UnifiedState>> {
        WatchStream::new(self.state.clone())
    }

    /// Latest published state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<UnifiedState> {
        Arc::clone(&self.state.borrow())
    }

    /// Add an instrument to the desired set.
    ///
    /// Pushed to the stream immediately when connected, otherwise applied on
    /// the next connect.
    pub fn add_instrument(&self, instrument: impl Into<Instrument>) {
        let instrument = instrument.into();
        if self.subscriptions.contains(&instrument) {
            return;
        }

        let live = self.subscriptions.add_instrument(instrument.clone());
        let pending = live.is_none();
        if let Some(changes) = live {
            self.stream.apply(changes);
        }

        metrics::set_desired_subscriptions(self.subscriptions.len());
        tracing::info!(%instrument, pending, "Instrument added");
        self.log(
            if pending {
                format!("Watching {instrument} (pending connection)")
            } else {
                format!("Watching {instrument}")
            },
            LogKind::Info,
        );
    }

    /// Remove an instrument from the desired set.
    pub fn remove_instrument(&self, instrument: &Instrument) {
        if !self.subscriptions.contains(instrument) {
            return;
        }

        if let Some(changes) = self.subscriptions.remove_instrument(instrument) {
            self.stream.apply(changes);
        }

        metrics::set_desired_subscriptions(self.subscriptions.len());
        tracing::info!(%instrument, "Instrument removed");
        if self
            .ingress
            .try_send(SyncEvent::Unwatched(instrument.clone()))
            .is_err()
        {
            tracing::debug!(%instrument, "Ingress full or closed, keeping last tick");
        }
        self.log(format!("Stopped watching {instrument}"), LogKind::Info);
    }

    /// Instruments currently desired, in order.
    #[must_use]
    pub fn instruments(&self) -> Vec<Instrument> {
        self.subscriptions.desired()
    }

    /// URL that starts the interactive login.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot produce one.
    pub async fn login_url(&self) -> Result<String, AuthError> {
        self.resolver.login_url().await
    }

    /// Reset the retry budget and reconnect the stream now.
    pub fn reconnect(&self) {
        self.stream.reconnect();
    }

    /// Stop polling, disconnect the stream and publish the final state.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        self.cancel.cancel();
        for (name, handle) in [("polling", tasks.polling), ("stream", tasks.stream)] {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "Task ended abnormally");
            }
        }

        self.ingress_stop.cancel();
        if let Err(e) = tasks.ingress.await {
            tracing::warn!(task = "ingress", error = %e, "Task ended abnormally");
        }

        tracing::info!("State coordinator stopped");
    }

    fn log(&self, message: String, kind: LogKind) {
        if self.ingress.try_send(SyncEvent::log(message, kind)).is_err() {
            tracing::debug!("Ingress full or closed, dropping log line");
        }
    }
}

impl Drop for StateCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ingress_stop.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::application::ports::PollError;
    use crate::application::services::polling::PollFailure;
    use crate::domain::market::Tick;

    fn snapshot(cycle: u64, market: serde_json::Value) -> PollSnapshot {
        let mut resources = BTreeMap::new();
        resources.insert(ResourceKind::Market, market);
        PollSnapshot::new(cycle, resources)
    }

    #[test]
    fn failed_poll_keeps_previous_snapshot() {
        let mut state = CoordinatorState::default();
        state.apply(SyncEvent::PollCommitted(snapshot(1, json!({"X": {"Close": 10}}))));

        state.apply(SyncEvent::PollFailed(PollFailure {
            cycle: 2,
            failures: vec![(ResourceKind::News, PollError::Status(503))],
        }));
        let published = state.publish();

        assert_eq!(published.poll_cycle, 1);
        assert_eq!(published.market["X"].price, Some(Decimal::from(10)));
        assert_eq!(published.logs.latest().unwrap().kind, LogKind::Alert);
    }

    #[test]
    fn recovery_is_logged_once() {
        let mut state = CoordinatorState::default();
        state.apply(SyncEvent::PollFailed(PollFailure {
            cycle: 1,
            failures: vec![(ResourceKind::Market, PollError::Timeout(4000))],
        }));
        state.apply(SyncEvent::PollCommitted(snapshot(2, json!({}))));
        state.apply(SyncEvent::PollCommitted(snapshot(3, json!({}))));

        let published = state.publish();
        let messages: Vec<_> = published.logs.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], "Backend polling recovered");
    }

    #[test]
    fn repeated_connection_state_is_not_a_change() {
        let mut state = CoordinatorState::default();
        assert!(state.apply(SyncEvent::Connection(ConnectionState::Connecting)));
        assert!(!state.apply(SyncEvent::Connection(ConnectionState::Connecting)));
        assert!(!state.apply(SyncEvent::Ticks(Vec::new())));
    }

    #[test]
    fn unwatched_instrument_falls_back_to_polled_price() {
        let mut state = CoordinatorState::default();
        state.apply(SyncEvent::PollCommitted(snapshot(1, json!({"X": {"Close": 10}}))));
        state.apply(SyncEvent::Ticks(vec![Tick::new("X", Decimal::from(11), Utc::now())]));
        assert_eq!(state.compose().market["X"].price, Some(Decimal::from(11)));

        assert!(state.apply(SyncEvent::Unwatched(Instrument::from("X"))));
        assert_eq!(state.compose().market["X"].price, Some(Decimal::from(10)));
        assert!(!state.apply(SyncEvent::Unwatched(Instrument::from("X"))));
    }

    #[test]
    fn revisions_increase() {
        let mut state = CoordinatorState::default();
        assert_eq!(state.publish().revision, 1);
        assert_eq!(state.publish().revision, 2);
        assert_eq!(state.compose().revision, 2);
    }

    #[tokio::test]
    async fn ready_events_publish_once() {
        let (tx, rx) = mpsc::channel(16);
        let (publisher, mut state_rx) = watch::channel(Arc::new(UnifiedState::default()));
        let stop = CancellationToken::new();

        tx.send(SyncEvent::PollCommitted(snapshot(1, json!({"X": {"Close": 10}}))))
            .await
            .unwrap();
        tx.send(SyncEvent::Ticks(vec![Tick::new("X", Decimal::from(11), Utc::now())]))
            .await
            .unwrap();
        tx.send(SyncEvent::Connection(ConnectionState::Connected))
            .await
            .unwrap();

        let task = tokio::spawn(run_ingress(
            CoordinatorState::default(),
            rx,
            publisher,
            stop.clone(),
        ));

        state_rx.changed().await.unwrap();
        let published = state_rx.borrow_and_update().clone();
        assert_eq!(published.revision, 1);
        assert_eq!(published.market["X"].price, Some(Decimal::from(11)));
        assert_eq!(published.connection, ConnectionState::Connected);

        stop.cancel();
        task.await.unwrap();
    }
}
