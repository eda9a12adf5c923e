//! Stream Connection
//!
//! Drives the push transport through its lifecycle:
//!
//! ```text
//! Idle ──► Connecting ──► Connected ──► Disconnected ──► Connecting ──► …
//!              │              │
//!              └──► Errored ◄─┘   (fault, or retry budget spent)
//! ```
//!
//! - Credentials are resolved before every attempt. If the very first
//!   resolve fails the stream stays `Idle` and parks until a manual reconnect
//! - On `Connected` the whole desired set is replayed in one subscribe call
//! - Drops and faults retry under [`ReconnectPolicy`]; once the budget is
//!   spent the connection settles in `Errored` and parks
//! - Cancellation moves to `Idle` from any state and closes the transport
//!
//! Every transition is reported to the coordinator as a [`SyncEvent`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{StreamTransport, TransportEvent};
use crate::domain::log::LogKind;
use crate::domain::state::ConnectionState;
use crate::domain::subscription::{SubscriptionChanges, SubscriptionManager};
use crate::infrastructure::metrics;

use super::auth::AuthTokenResolver;
use super::events::SyncEvent;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};

/// Buffered transport events per session.
const SESSION_EVENT_BUFFER: usize = 1024;

// =============================================================================
// Commands
// =============================================================================

/// Request sent to a running stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    /// Push subscription changes if the stream is live.
    Apply(SubscriptionChanges),
    /// Reset the retry budget and connect now.
    Reconnect,
}

/// Cheap handle for steering a running [`StreamConnection`].
#[derive(Debug, Clone)]
pub struct StreamHandle {
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamHandle {
    /// Forward subscription changes.
    pub fn apply(&self, changes: SubscriptionChanges) {
        if changes.is_empty() {
            return;
        }
        if self.commands.send(StreamCommand::Apply(changes)).is_err() {
            tracing::debug!("Stream connection stopped, dropping subscription change");
        }
    }

    /// Request a manual reconnect.
    pub fn reconnect(&self) {
        if self.commands.send(StreamCommand::Reconnect).is_err() {
            tracing::debug!("Stream connection stopped, ignoring reconnect");
        }
    }
}

// =============================================================================
// Stream Connection
// =============================================================================

enum Next {
    Attempt,
    Backoff(Duration),
    Park,
    Exit,
}

/// Lifecycle state machine for the push transport.
pub struct StreamConnection {
    transport: Arc<dyn StreamTransport>,
    resolver: AuthTokenResolver,
    subscriptions: Arc<SubscriptionManager>,
    policy: ReconnectPolicy,
    ingress: mpsc::Sender<SyncEvent>,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    cancel: CancellationToken,
    state: ConnectionState,
}

impl StreamConnection {
    /// Create a connection and the handle that steers it.
    #[must_use]
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        resolver: AuthTokenResolver,
        subscriptions: Arc<SubscriptionManager>,
        reconnect: ReconnectConfig,
        ingress: mpsc::Sender<SyncEvent>,
        cancel: CancellationToken,
    ) -> (Self, StreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            transport,
            resolver,
            subscriptions,
            policy: ReconnectPolicy::new(reconnect),
            ingress,
            commands: rx,
            cancel,
            state: ConnectionState::Idle,
        };
        (connection, StreamHandle { commands: tx })
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        let mut next = Next::Attempt;
        loop {
            next = match next {
                Next::Attempt => self.attempt().await,
                Next::Backoff(delay) => self.backoff(delay).await,
                Next::Park => self.park().await,
                Next::Exit => break,
            };
        }

        self.transport.disconnect().await;
        self.subscriptions.on_disconnected();
        let was_idle = self.state == ConnectionState::Idle;
        self.set_state(ConnectionState::Idle).await;
        if !was_idle {
            self.log("Live stream stopped", LogKind::Info).await;
        }
        tracing::info!("Stream connection stopped");
    }

    /// One connect attempt, followed by the session if it succeeds.
    async fn attempt(&mut self) -> Next {
        let resolved = tokio::select! {
            () = self.cancel.cancelled() => return Next::Exit,
            result = self.resolver.resolve() => result,
        };

        let credentials = match resolved {
            Ok(credentials) => credentials,
            Err(e) if self.state == ConnectionState::Idle => {
                self.log(format!("Live stream disabled: {e}"), LogKind::Alert)
                    .await;
                return Next::Park;
            }
            Err(e) => {
                self.log(format!("Credential refresh failed: {e}"), LogKind::Alert)
                    .await;
                return self.after_failure(ConnectionState::Disconnected).await;
            }
        };

        let attempt = self.policy.failures() + 1;
        self.set_state(ConnectionState::Connecting).await;
        tracing::info!(attempt, "Connecting to live stream");
        self.log(format!("Connecting to live stream (attempt {attempt})"), LogKind::Info)
            .await;

        let (tx, mut events) = mpsc::channel(SESSION_EVENT_BUFFER);
        let connected = tokio::select! {
            () = self.cancel.cancelled() => return Next::Exit,
            result = self.transport.connect(&credentials, tx) => result,
        };

        if let Err(e) = connected {
            tracing::warn!(error = %e, "Live stream connect failed");
            self.log(format!("Live stream connect failed: {e}"), LogKind::Alert)
                .await;
            return self.after_failure(ConnectionState::Disconnected).await;
        }

        self.session(&mut events).await
    }

    /// Pump transport events and commands for one session.
    async fn session(&mut self, events: &mut mpsc::Receiver<TransportEvent>) -> Next {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Next::Exit,
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Apply(changes)) => self.apply(changes).await,
                    Some(StreamCommand::Reconnect) => {
                        self.transport.disconnect().await;
                        self.subscriptions.on_disconnected();
                        self.policy.reset();
                        self.log("Manual reconnect requested", LogKind::Info).await;
                        return Next::Attempt;
                    }
                    None => return Next::Exit,
                },
                event = events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        if let Err(next) = self.on_connected().await {
                            return next;
                        }
                    }
                    Some(TransportEvent::Ticks(mut batch)) => {
                        if self.state != ConnectionState::Connected {
                            continue;
                        }
                        // Frames already in flight for removed instruments.
                        batch.retain(|tick| self.subscriptions.contains(&tick.instrument));
                        if batch.is_empty() {
                            continue;
                        }
                        metrics::record_tick_batch(batch.len());
                        if self.ingress.send(SyncEvent::Ticks(batch)).await.is_err() {
                            return Next::Exit;
                        }
                    }
                    Some(TransportEvent::Disconnected { reason }) => {
                        tracing::warn!(%reason, "Live stream disconnected");
                        self.log(format!("Live stream disconnected: {reason}"), LogKind::Alert)
                            .await;
                        return self.after_failure(ConnectionState::Disconnected).await;
                    }
                    Some(TransportEvent::Error(message)) => {
                        tracing::warn!(error = %message, "Live stream fault");
                        self.transport.disconnect().await;
                        self.log(format!("Live stream error: {message}"), LogKind::Alert)
                            .await;
                        return self.after_failure(ConnectionState::Errored).await;
                    }
                    None => {
                        self.log("Live stream closed", LogKind::Alert).await;
                        return self.after_failure(ConnectionState::Disconnected).await;
                    }
                },
            }
        }
    }

    /// Replay the desired set and report the connection.
    async fn on_connected(&mut self) -> Result<(), Next> {
        let replay = self.subscriptions.on_connected();

        if !replay.is_empty() {
            if let Err(e) = self.transport.subscribe(&replay).await {
                tracing::warn!(error = %e, "Subscription replay failed");
                self.transport.disconnect().await;
                self.log(format!("Subscription replay failed: {e}"), LogKind::Alert)
                    .await;
                return Err(self.after_failure(ConnectionState::Disconnected).await);
            }
        }

        self.policy.reset();
        self.set_state(ConnectionState::Connected).await;
        tracing::info!(instruments = replay.len(), "Live stream connected");
        self.log(
            format!("Live stream connected ({} instruments)", replay.len()),
            LogKind::Success,
        )
        .await;
        Ok(())
    }

    /// Push subscription changes while live. Offline changes are already
    /// recorded in the desired set and go out with the next replay.
    async fn apply(&self, changes: SubscriptionChanges) {
        if self.state != ConnectionState::Connected {
            return;
        }

        if !changes.subscribe.is_empty() {
            if let Err(e) = self.transport.subscribe(&changes.subscribe).await {
                tracing::warn!(error = %e, "Subscribe failed");
            }
        }
        if !changes.unsubscribe.is_empty() {
            if let Err(e) = self.transport.unsubscribe(&changes.unsubscribe).await {
                tracing::warn!(error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Schedule a retry or give up.
    async fn after_failure(&mut self, state: ConnectionState) -> Next {
        self.subscriptions.on_disconnected();

        if let Some(delay) = self.policy.on_failure() {
            self.set_state(state).await;
            metrics::record_reconnect();

            let attempt = self.policy.failures() + 1;
            let max = self.policy.max_attempts();
            tracing::info!(attempt, max, delay_ms = delay.as_millis(), "Scheduling reconnect");

            let budget = if max == 0 {
                String::new()
            } else {
                format!("/{max}")
            };
            self.log(
                format!(
                    "Reconnecting in {:.1}s (attempt {attempt}{budget})",
                    delay.as_secs_f64()
                ),
                LogKind::Info,
            )
            .await;
            Next::Backoff(delay)
        } else {
            let failures = self.policy.failures();
            self.set_state(ConnectionState::Errored).await;
            metrics::record_reconnect_exhausted();
            tracing::error!(failures, "Reconnect budget exhausted, live stream stopped");
            self.log(
                format!("Live stream gave up after {failures} attempts"),
                LogKind::Alert,
            )
            .await;
            Next::Park
        }
    }

    /// Wait out a reconnect delay.
    async fn backoff(&mut self, delay: Duration) -> Next {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Next::Exit,
                () = &mut sleep => return Next::Attempt,
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Reconnect) => {
                        self.policy.reset();
                        self.log("Manual reconnect requested", LogKind::Info).await;
                        return Next::Attempt;
                    }
                    Some(StreamCommand::Apply(_)) => {}
                    None => return Next::Exit,
                },
            }
        }
    }

    /// Wait for a manual reconnect.
    async fn park(&mut self) -> Next {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Next::Exit,
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Reconnect) => {
                        self.policy.reset();
                        self.log("Manual reconnect requested", LogKind::Info).await;
                        return Next::Attempt;
                    }
                    Some(StreamCommand::Apply(_)) => {}
                    None => return Next::Exit,
                },
            }
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Stream state change");
        self.state = state;
        metrics::set_connection_state(state);
        let _ = self.ingress.send(SyncEvent::Connection(state)).await;
    }

    async fn log(&self, message: impl Into<String>, kind: LogKind) {
        let _ = self.ingress.send(SyncEvent::log(message, kind)).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::{AuthError, Credentials, TokenSource, TransportError};
    use crate::domain::market::{Instrument, Tick};

    struct StaticTokens(Result<Credentials, AuthError>);

    #[async_trait]
    impl TokenSource for StaticTokens {
        async fn fetch_credentials(&self) -> Result<Credentials, AuthError> {
            self.0.clone()
        }

        async fn login_url(&self) -> Result<String, AuthError> {
            Ok("https://login".to_string())
        }
    }

    /// Accepts every connect and reports `Connected` right away.
    #[derive(Default)]
    struct EchoTransport {
        connects: AtomicUsize,
        subscribes: Mutex<Vec<Vec<Instrument>>>,
        session: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait]
    impl StreamTransport for EchoTransport {
        async fn connect(
            &self,
            _credentials: &Credentials,
            events: mpsc::Sender<TransportEvent>,
        ) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            events
                .send(TransportEvent::Connected)
                .await
                .map_err(|_| TransportError::Closed)?;
            *self.session.lock() = Some(events);
            Ok(())
        }

        async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), TransportError> {
            self.subscribes.lock().push(instruments.to_vec());
            Ok(())
        }

        async fn unsubscribe(&self, _instruments: &[Instrument]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&self) {
            self.session.lock().take();
        }
    }

    /// Ends the first session with a server fault and the second with a drop.
    /// Later sessions stay up.
    #[derive(Default)]
    struct FlakyTransport {
        connects: AtomicUsize,
        subscribes: Mutex<Vec<Vec<Instrument>>>,
        session: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait]
    impl StreamTransport for FlakyTransport {
        async fn connect(
            &self,
            _credentials: &Credentials,
            events: mpsc::Sender<TransportEvent>,
        ) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            events
                .try_send(TransportEvent::Connected)
                .map_err(|_| TransportError::Closed)?;
            *self.session.lock() = Some(events);
            Ok(())
        }

        async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), TransportError> {
            self.subscribes.lock().push(instruments.to_vec());
            let ending = match self.connects.load(Ordering::SeqCst) {
                1 => Some(TransportEvent::Error("Invalid session".to_string())),
                2 => Some(TransportEvent::Disconnected {
                    reason: "network".to_string(),
                }),
                _ => None,
            };
            if let (Some(event), Some(session)) = (ending, self.session.lock().as_ref()) {
                let _ = session.try_send(event);
            }
            Ok(())
        }

        async fn unsubscribe(&self, _instruments: &[Instrument]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&self) {
            self.session.lock().take();
        }
    }

    fn spawn(
        transport: Arc<dyn StreamTransport>,
        tokens: Result<Credentials, AuthError>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> (StreamHandle, mpsc::Receiver<SyncEvent>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (ingress, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let (connection, handle) = StreamConnection::new(
            transport,
            AuthTokenResolver::new(Arc::new(StaticTokens(tokens))),
            subscriptions,
            ReconnectConfig {
                jitter_factor: 0.0,
                ..ReconnectConfig::default()
            },
            ingress,
            cancel.clone(),
        );
        (handle, rx, cancel.clone(), tokio::spawn(connection.run()))
    }

    async fn wait_for_state(rx: &mut mpsc::Receiver<SyncEvent>, wanted: ConnectionState) {
        while let Some(event) = rx.recv().await {
            if let SyncEvent::Connection(state) = event {
                if state == wanted {
                    return;
                }
            }
        }
        panic!("ingress closed before reaching {wanted}");
    }

    #[tokio::test]
    async fn missing_credentials_park_in_idle() {
        let transport = Arc::new(EchoTransport::default());
        let (_handle, mut rx, cancel, task) = spawn(
            transport.clone(),
            Err(AuthError::Unavailable("no session".to_string())),
            Arc::new(SubscriptionManager::new()),
        );

        match rx.recv().await.unwrap() {
            SyncEvent::Log { message, kind } => {
                assert_eq!(kind, LogKind::Alert);
                assert!(message.contains("disabled"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_replays_desired_set_once() {
        let transport = Arc::new(EchoTransport::default());
        let subscriptions = Arc::new(SubscriptionManager::with_instruments([
            Instrument::from("A"),
            Instrument::from("B"),
        ]));
        let (_handle, mut rx, cancel, task) = spawn(
            transport.clone(),
            Credentials::new("key", "token"),
            subscriptions.clone(),
        );

        wait_for_state(&mut rx, ConnectionState::Connected).await;

        assert_eq!(
            *transport.subscribes.lock(),
            vec![vec![Instrument::from("A"), Instrument::from("B")]]
        );
        assert!(subscriptions.is_live());

        cancel.cancel();
        task.await.unwrap();
        assert!(!subscriptions.is_live());
    }

    #[tokio::test]
    async fn live_changes_are_pushed() {
        let transport = Arc::new(EchoTransport::default());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let (handle, mut rx, cancel, task) = spawn(
            transport.clone(),
            Credentials::new("key", "token"),
            subscriptions.clone(),
        );

        wait_for_state(&mut rx, ConnectionState::Connected).await;

        let changes = subscriptions.add_instrument("C".into()).unwrap();
        handle.apply(changes);
        for _ in 0..100 {
            if !transport.subscribes.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(*transport.subscribes.lock(), vec![vec![Instrument::from("C")]]);
    }

    #[tokio::test]
    async fn cancellation_ends_in_idle() {
        let transport = Arc::new(EchoTransport::default());
        let (_handle, mut rx, cancel, task) = spawn(
            transport,
            Credentials::new("key", "token"),
            Arc::new(SubscriptionManager::new()),
        );

        wait_for_state(&mut rx, ConnectionState::Connected).await;
        cancel.cancel();
        task.await.unwrap();

        wait_for_state(&mut rx, ConnectionState::Idle).await;
        match rx.recv().await.unwrap() {
            SyncEvent::Log { message, .. } => assert_eq!(message, "Live stream stopped"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fault_and_drop_reconnect_with_full_replay() {
        let transport = Arc::new(FlakyTransport::default());
        let subscriptions = Arc::new(SubscriptionManager::with_instruments([
            Instrument::from("A"),
            Instrument::from("B"),
        ]));
        let (_handle, mut rx, cancel, task) = spawn(
            transport.clone(),
            Credentials::new("key", "token"),
            subscriptions,
        );

        let mut states = Vec::new();
        let mut logs = Vec::new();
        while states.iter().filter(|s| **s == ConnectionState::Connected).count() < 3 {
            match rx.recv().await.unwrap() {
                SyncEvent::Connection(state) => states.push(state),
                SyncEvent::Log { message, .. } => logs.push(message),
                _ => {}
            }
        }

        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Errored,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        let full = vec![Instrument::from("A"), Instrument::from("B")];
        assert_eq!(*transport.subscribes.lock(), vec![full.clone(), full.clone(), full]);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
        assert!(logs.iter().any(|m| m == "Live stream error: Invalid session"));
        assert!(logs.iter().any(|m| m == "Live stream disconnected: network"));
        assert_eq!(
            logs.iter().filter(|m| m.starts_with("Connecting to live stream")).count(),
            3
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ticks_for_removed_instruments_are_dropped() {
        let transport = Arc::new(EchoTransport::default());
        let subscriptions = Arc::new(SubscriptionManager::with_instruments([
            Instrument::from("A"),
            Instrument::from("B"),
        ]));
        let (_handle, mut rx, cancel, task) = spawn(
            transport.clone(),
            Credentials::new("key", "token"),
            subscriptions.clone(),
        );

        wait_for_state(&mut rx, ConnectionState::Connected).await;
        let _ = subscriptions.remove_instrument(&Instrument::from("B"));

        let session = transport.session.lock().clone().unwrap();
        let now = chrono::Utc::now();
        session
            .send(TransportEvent::Ticks(vec![
                Tick::new("A", rust_decimal::Decimal::from(1), now),
                Tick::new("B", rust_decimal::Decimal::from(2), now),
            ]))
            .await
            .unwrap();

        loop {
            if let SyncEvent::Ticks(batch) = rx.recv().await.unwrap() {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].instrument, Instrument::from("A"));
                break;
            }
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
