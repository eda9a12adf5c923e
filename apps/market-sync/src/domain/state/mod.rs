//! Unified State
//!
//! The single view handed to readers: the last committed poll snapshot with
//! live ticks overlaid on market prices, plus connection state, diagnostic
//! log and derived signals.
//!
//! # Overlay
//!
//! ```text
//! PollSnapshot.market ─┐
//!                      ├──► compose() ──► UnifiedState.market
//! TickSnapshot ────────┘      (tick price supersedes polled price)
//! ```
//!
//! Only the price of a market entry is overlaid. Every other poll-sourced
//! field is carried through verbatim.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::log::LogBuffer;
use crate::domain::market::{InstrumentMap, QuantileForecast, Tick, TickSnapshot};
use crate::domain::signal::InstrumentSignals;

// =============================================================================
// Resources
// =============================================================================

/// A REST resource fetched on every poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Intraday market snapshot keyed by ticker.
    Market,
    /// Quantile forecasts keyed by instrument.
    Predictions,
    /// Latest news with sentiment.
    News,
    /// Detected intraday shocks.
    Shocks,
    /// Currently working order.
    Order,
    /// Backend system status.
    Status,
}

impl ResourceKind {
    /// Every resource, in fetch order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Market,
            Self::Predictions,
            Self::News,
            Self::Shocks,
            Self::Order,
            Self::Status,
        ]
    }

    /// Backend path serving this resource.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Market => "/api/market-data",
            Self::Predictions => "/api/predictions",
            Self::News => "/api/news",
            Self::Shocks => "/api/shocks",
            Self::Order => "/api/live-order",
            Self::Status => "/api/system-status",
        }
    }

    /// Short name used in logs, metrics labels and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Predictions => "predictions",
            Self::News => "news",
            Self::Shocks => "shocks",
            Self::Order => "order",
            Self::Status => "status",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown resource name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource: {0}")]
pub struct UnknownResource(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "market" | "market-data" => Ok(Self::Market),
            "predictions" => Ok(Self::Predictions),
            "news" => Ok(Self::News),
            "shocks" => Ok(Self::Shocks),
            "order" | "live-order" => Ok(Self::Order),
            "status" | "system-status" => Ok(Self::Status),
            other => Err(UnknownResource(other.to_string())),
        }
    }
}

// =============================================================================
// Poll Snapshot
// =============================================================================

/// Payloads from the last fully successful poll cycle, stored verbatim.
///
/// Replaced only as a whole; a snapshot never mixes cycles.
#[derive(Debug, Clone, Default)]
pub struct PollSnapshot {
    cycle: u64,
    resources: Arc<BTreeMap<ResourceKind, Value>>,
}

impl PollSnapshot {
    /// Build a snapshot for a completed cycle.
    #[must_use]
    pub fn new(cycle: u64, resources: BTreeMap<ResourceKind, Value>) -> Self {
        Self {
            cycle,
            resources: Arc::new(resources),
        }
    }

    /// Poll cycle that produced this snapshot. Zero before the first commit.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Payload for a resource.
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> Option<&Value> {
        self.resources.get(&kind)
    }

    /// Payload for a resource, `null` when not fetched.
    #[must_use]
    pub fn value_or_null(&self, kind: ResourceKind) -> Value {
        self.get(kind).cloned().unwrap_or(Value::Null)
    }

    /// Resources present.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.resources.keys().copied()
    }

    /// Whether nothing has been committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the push stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not started, parked without credentials, or shut down.
    #[default]
    Idle,
    /// Attempting to connect.
    Connecting,
    /// Transport up and subscriptions replayed.
    Connected,
    /// Transport dropped; a retry is scheduled.
    Disconnected,
    /// Retry budget spent; waiting for a manual reconnect.
    Errored,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Errored => "errored",
        }
    }

    /// Numeric code for the connection gauge.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Disconnected => 3,
            Self::Errored => 4,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Market Entries
// =============================================================================

/// Where a market entry's price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Last poll cycle.
    Polled,
    /// Live tick.
    Live,
}

/// One instrument in the unified market view.
///
/// When `tick` is present, `price` equals `tick.price` and `source` is
/// [`PriceSource::Live`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketEntry {
    /// Displayed price.
    pub price: Option<Decimal>,
    /// Origin of `price`.
    pub source: PriceSource,
    /// Polled payload for this key, untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polled: Option<Value>,
    /// Latest live tick overlaid on this key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<Tick>,
}

impl MarketEntry {
    fn polled(payload: &Value) -> Self {
        Self {
            price: polled_price(payload),
            source: PriceSource::Polled,
            polled: Some(payload.clone()),
            tick: None,
        }
    }

    fn overlay(&mut self, tick: &Tick) {
        self.price = Some(tick.price);
        self.source = PriceSource::Live;
        self.tick = Some(tick.clone());
    }
}

const PRICE_FIELDS: [&str; 5] = ["price", "Close", "close", "last_price", "ltp"];

/// Extract the displayed price from a polled market payload.
///
/// Accepts a bare number, an object with a recognised price field, or a
/// series of either, in which case the last point wins.
#[must_use]
pub fn polled_price(payload: &Value) -> Option<Decimal> {
    match payload {
        Value::Number(n) => n.as_f64().and_then(|v| Decimal::try_from(v).ok()),
        Value::String(s) => s.parse().ok(),
        Value::Array(points) => points.iter().rev().find_map(polled_price),
        Value::Object(fields) => PRICE_FIELDS
            .iter()
            .find_map(|key| fields.get(*key))
            .and_then(polled_price),
        _ => None,
    }
}

// =============================================================================
// Unified State
// =============================================================================

/// The published view. Immutable once built.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnifiedState {
    /// Polled market entries with live prices overlaid.
    pub market: BTreeMap<String, MarketEntry>,
    /// Forecast payload, verbatim.
    pub predictions: Value,
    /// News payload, verbatim.
    pub news: Value,
    /// Shocks payload, verbatim.
    pub shocks: Value,
    /// Live order payload, verbatim.
    pub order: Value,
    /// System status payload, verbatim.
    pub status: Value,
    /// Banner and indicator signals per forecast instrument.
    pub signals: BTreeMap<String, InstrumentSignals>,
    /// Stream connection state.
    pub connection: ConnectionState,
    /// Diagnostic log, oldest first.
    pub logs: LogBuffer,
    /// Monotonic publish counter.
    pub revision: u64,
    /// Poll cycle the poll-sourced fields came from.
    pub poll_cycle: u64,
}

/// Everything [`compose`] reads.
#[derive(Debug, Clone, Copy)]
pub struct ComposeInput<'a> {
    /// Last committed poll snapshot.
    pub poll: &'a PollSnapshot,
    /// Latest ticks.
    pub ticks: &'a TickSnapshot,
    /// Stream token to market key bridge.
    pub aliases: &'a InstrumentMap,
    /// Current connection state.
    pub connection: ConnectionState,
    /// Current log.
    pub logs: &'a LogBuffer,
    /// Revision to stamp.
    pub revision: u64,
}

/// Build a unified state from the poll snapshot and the tick overlay.
#[must_use]
pub fn compose(input: ComposeInput<'_>) -> UnifiedState {
    let poll = input.poll;

    let mut market: BTreeMap<String, MarketEntry> = match poll.get(ResourceKind::Market) {
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(key, payload)| (key.clone(), MarketEntry::polled(payload)))
            .collect(),
        _ => BTreeMap::new(),
    };

    for (instrument, tick) in input.ticks.iter() {
        let key = input.aliases.market_key(instrument);
        market
            .entry(key.to_string())
            .or_insert_with(|| MarketEntry {
                price: None,
                source: PriceSource::Live,
                polled: None,
                tick: None,
            })
            .overlay(tick);
    }

    let predictions = poll.value_or_null(ResourceKind::Predictions);
    let signals = latest_forecasts(&predictions)
        .into_iter()
        .map(|(key, forecast)| (key, InstrumentSignals::from_forecast(forecast.as_ref())))
        .collect();

    UnifiedState {
        market,
        predictions,
        news: poll.value_or_null(ResourceKind::News),
        shocks: poll.value_or_null(ResourceKind::Shocks),
        order: poll.value_or_null(ResourceKind::Order),
        status: poll.value_or_null(ResourceKind::Status),
        signals,
        connection: input.connection,
        logs: input.logs.clone(),
        revision: input.revision,
        poll_cycle: poll.cycle(),
    }
}

/// Latest forecast step per instrument in a predictions payload.
///
/// Instruments with an empty or unparsable series map to `None`.
#[must_use]
pub fn latest_forecasts(predictions: &Value) -> BTreeMap<String, Option<QuantileForecast>> {
    match predictions {
        Value::Object(series) => series
            .iter()
            .map(|(key, steps)| (key.clone(), QuantileForecast::latest(steps)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================
