//! Market Data Types
//!
//! Instruments, live ticks, the copy-on-write tick snapshot, and quantile
//! forecasts. Everything here is plain data with no I/O.
//!
//! # Tick Merging
//!
//! Ticks are keyed by instrument and merged last-write-wins by arrival
//! order. The transport delivers in order within one connection, so arrival
//! order is the authority, not the tick's own timestamp.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Instrument
// =============================================================================

/// Instrument identifier: a ticker symbol or a numeric instrument token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    /// Create an instrument from a symbol or token string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create an instrument from a numeric exchange token.
    #[must_use]
    pub fn from_token(token: u32) -> Self {
        Self(token.to_string())
    }

    /// The identifier as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric token, when the identifier is one.
    #[must_use]
    pub fn token(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Instrument {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for Instrument {
    fn from(token: u32) -> Self {
        Self::from_token(token)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// Day OHLC carried by quote and full-mode ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlc {
    /// Day open.
    pub open: Decimal,
    /// Day high.
    pub high: Decimal,
    /// Day low.
    pub low: Decimal,
    /// Previous close.
    pub close: Decimal,
}

/// A single push-delivered price update for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument the update belongs to.
    pub instrument: Instrument,
    /// Last traded price.
    pub price: Decimal,
    /// Exchange timestamp when present, otherwise arrival time.
    pub timestamp: DateTime<Utc>,
    /// Volume traded today.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    /// Day OHLC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
}

impl Tick {
    /// Create a price-only tick.
    #[must_use]
    pub fn new(instrument: impl Into<Instrument>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            price,
            timestamp,
            volume: None,
            ohlc: None,
        }
    }

    /// Attach a traded volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: u64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Attach day OHLC.
    #[must_use]
    pub const fn with_ohlc(mut self, ohlc: Ohlc) -> Self {
        self.ohlc = Some(ohlc);
        self
    }
}

// =============================================================================
// Tick Snapshot
// =============================================================================

/// Latest tick per instrument.
///
/// The map sits behind an `Arc`; merging builds a new map, so a reader that
/// holds an older snapshot keeps seeing exactly what it was handed.
#[derive(Debug, Clone, Default)]
pub struct TickSnapshot {
    ticks: Arc<BTreeMap<Instrument, Tick>>,
}

impl TickSnapshot {
    /// Latest tick for an instrument.
    #[must_use]
    pub fn get(&self, instrument: &Instrument) -> Option<&Tick> {
        self.ticks.get(instrument)
    }

    /// Iterate instruments and ticks in instrument order.
    pub fn iter(&self) -> impl Iterator<Item = (&Instrument, &Tick)> {
        self.ticks.iter()
    }

    /// Number of instruments seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// Whether no tick has been merged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Whether two snapshots share the same underlying map.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ticks, &other.ticks)
    }
}

/// Merges tick batches into snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickMerger;

impl TickMerger {
    /// Merge a batch on top of `snapshot`, last write wins.
    ///
    /// Returns the input snapshot untouched when the batch is empty.
    #[must_use]
    pub fn apply(snapshot: &TickSnapshot, batch: &[Tick]) -> TickSnapshot {
        if batch.is_empty() {
            return snapshot.clone();
        }

        let mut next = (*snapshot.ticks).clone();
        for tick in batch {
            next.insert(tick.instrument.clone(), tick.clone());
        }

        TickSnapshot {
            ticks: Arc::new(next),
        }
    }

    /// Drop the last tick of `instrument`.
    ///
    /// Returns the input snapshot untouched when there is nothing to drop.
    #[must_use]
    pub fn evict(snapshot: &TickSnapshot, instrument: &Instrument) -> TickSnapshot {
        if snapshot.get(instrument).is_none() {
            return snapshot.clone();
        }

        let mut next = (*snapshot.ticks).clone();
        next.remove(instrument);

        TickSnapshot {
            ticks: Arc::new(next),
        }
    }
}

// =============================================================================
// Quantile Forecast
// =============================================================================

/// One horizon step of a probabilistic forecast.
///
/// `p05 <= p50 <= p95` is expected but not enforced: an unordered triple
/// points at an upstream model defect and is passed through as received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileForecast {
    /// 5th percentile.
    pub p05: f64,
    /// Median.
    pub p50: f64,
    /// 95th percentile.
    pub p95: f64,
}

impl QuantileForecast {
    /// Create a forecast step.
    #[must_use]
    pub const fn new(p05: f64, p50: f64, p95: f64) -> Self {
        Self { p05, p50, p95 }
    }

    /// Whether the quantiles are in non-decreasing order.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.p05 <= self.p50 && self.p50 <= self.p95
    }

    /// Read a step from a prediction payload entry.
    ///
    /// Only `p50` is required; missing outer quantiles collapse onto it.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let p50 = value.get("p50").and_then(Value::as_f64)?;
        let p05 = value.get("p05").and_then(Value::as_f64).unwrap_or(p50);
        let p95 = value.get("p95").and_then(Value::as_f64).unwrap_or(p50);
        Some(Self { p05, p50, p95 })
    }

    /// Latest step from a per-instrument forecast list.
    ///
    /// The backend returns steps oldest first, so the last parsable entry wins.
    #[must_use]
    pub fn latest(steps: &Value) -> Option<Self> {
        match steps {
            Value::Array(items) => items.iter().rev().find_map(Self::from_value),
            Value::Object(_) => Self::from_value(steps),
            _ => None,
        }
    }
}

// =============================================================================
// Instrument Aliases
// =============================================================================

/// Maps stream instruments onto the keys the backend uses for market data.
///
/// The ticker streams numeric tokens while the market snapshot is keyed by
/// provider tickers (`GC=F`), so the overlay needs a bridge. Instruments
/// without an alias overlay under their own identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentMap {
    aliases: HashMap<Instrument, String>,
}

impl InstrumentMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an alias.
    #[must_use]
    pub fn with_alias(mut self, instrument: impl Into<Instrument>, market_key: impl Into<String>) -> Self {
        self.aliases.insert(instrument.into(), market_key.into());
        self
    }

    /// Parse `token:market_key` pairs separated by commas.
    ///
    /// The first `:` splits each pair, so keys such as `GC=F` survive intact.
    /// Malformed pairs are skipped.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let aliases = spec
            .split(',')
            .filter_map(|pair| {
                let (instrument, key) = pair.trim().split_once(':')?;
                let (instrument, key) = (instrument.trim(), key.trim());
                if instrument.is_empty() || key.is_empty() {
                    return None;
                }
                Some((Instrument::new(instrument), key.to_string()))
            })
            .collect();
        Self { aliases }
    }

    /// Market key an instrument overlays onto.
    #[must_use]
    pub fn market_key<'a>(&'a self, instrument: &'a Instrument) -> &'a str {
        self.aliases
            .get(instrument)
            .map_or_else(|| instrument.as_str(), String::as_str)
    }

    /// Number of registered aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    /// Whether no aliases are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_768_800_000 + secs, 0).unwrap()
    }

    fn tick(instrument: &str, price: i64, at: i64) -> Tick {
        Tick::new(instrument, Decimal::from(price), ts(at))
    }

    #[test]
    fn instrument_token_roundtrip() {
        let instrument = Instrument::from_token(408_065);
        assert_eq!(instrument.as_str(), "408065");
        assert_eq!(instrument.token(), Some(408_065));
        assert_eq!(Instrument::from("GC=F").token(), None);
    }

    #[test]
    fn merge_overwrites_per_instrument() {
        let empty = TickSnapshot::default();
        let first = TickMerger::apply(&empty, &[tick("A", 10, 0), tick("B", 20, 0)]);
        let second = TickMerger::apply(&first, &[tick("A", 11, 1)]);

        assert_eq!(second.get(&"A".into()).unwrap().price, Decimal::from(11));
        assert_eq!(second.get(&"B".into()).unwrap().price, Decimal::from(20));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn merge_within_batch_is_last_write_wins() {
        let merged = TickMerger::apply(
            &TickSnapshot::default(),
            &[tick("A", 10, 5), tick("A", 9, 1)],
        );

        // Arrival order wins even though the second tick carries an older timestamp.
        assert_eq!(merged.get(&"A".into()).unwrap().price, Decimal::from(9));
    }

    #[test]
    fn merge_replaces_whole_tick() {
        let with_volume = tick("A", 10, 0).with_volume(500);
        let bare = tick("A", 12, 1);

        let first = TickMerger::apply(&TickSnapshot::default(), &[with_volume]);
        let second = TickMerger::apply(&first, &[bare]);

        assert_eq!(second.get(&"A".into()).unwrap().volume, None);
    }

    #[test]
    fn merge_leaves_older_snapshot_untouched() {
        let first = TickMerger::apply(&TickSnapshot::default(), &[tick("A", 10, 0)]);
        let held = first.clone();
        let second = TickMerger::apply(&first, &[tick("A", 11, 1), tick("C", 1, 1)]);

        assert_eq!(held.get(&"A".into()).unwrap().price, Decimal::from(10));
        assert!(held.get(&"C".into()).is_none());
        assert!(!held.ptr_eq(&second));
    }

    #[test]
    fn evict_drops_only_that_instrument() {
        let full = TickMerger::apply(&TickSnapshot::default(), &[tick("A", 10, 0), tick("B", 5, 0)]);

        let evicted = TickMerger::evict(&full, &"A".into());
        assert!(evicted.get(&"A".into()).is_none());
        assert_eq!(evicted.get(&"B".into()).unwrap().price, Decimal::from(5));
        assert_eq!(full.len(), 2);

        assert!(TickMerger::evict(&evicted, &"A".into()).ptr_eq(&evicted));
    }

    #[test]
    fn empty_batch_shares_snapshot() {
        let first = TickMerger::apply(&TickSnapshot::default(), &[tick("A", 10, 0)]);
        let same = TickMerger::apply(&first, &[]);
        assert!(first.ptr_eq(&same));
    }

    #[test]
    fn forecast_latest_takes_last_step() {
        let steps = json!([
            {"date": "2026-01-18", "p05": -0.01, "p50": 0.001, "p95": 0.01},
            {"date": "2026-01-19", "p05": -0.01, "p50": 0.006, "p95": 0.02}
        ]);

        let latest = QuantileForecast::latest(&steps).unwrap();
        assert!((latest.p50 - 0.006).abs() < f64::EPSILON);
        assert!(latest.is_ordered());
    }

    #[test]
    fn forecast_unordered_passes_through() {
        let steps = json!([{"p05": 0.02, "p50": 0.001, "p95": -0.01}]);

        let latest = QuantileForecast::latest(&steps).unwrap();
        assert!(!latest.is_ordered());
        assert!((latest.p05 - 0.02).abs() < f64::EPSILON);
        assert!((latest.p95 + 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn forecast_missing_median_is_none() {
        assert!(QuantileForecast::latest(&json!([])).is_none());
        assert!(QuantileForecast::latest(&json!([{"p05": 0.1}])).is_none());
        assert!(QuantileForecast::latest(&json!("GOLD")).is_none());
    }

    #[test]
    fn alias_parse_keeps_equals_in_key() {
        let map = InstrumentMap::parse("408065:GC=F, 53505799 : SI=F,broken,:x");

        assert_eq!(map.len(), 2);
        assert_eq!(map.market_key(&"408065".into()), "GC=F");
        assert_eq!(map.market_key(&"53505799".into()), "SI=F");
        assert_eq!(map.market_key(&"NG=F".into()), "NG=F");
    }

    proptest! {
        #[test]
        fn merged_value_is_last_seen(
            batches in prop::collection::vec(
                prop::collection::vec((0u8..6, 0i64..10_000), 0..8),
                0..8,
            )
        ) {
            let mut snapshot = TickSnapshot::default();
            let mut expected: HashMap<String, i64> = HashMap::new();

            for (n, batch) in batches.iter().enumerate() {
                let ticks: Vec<Tick> = batch
                    .iter()
                    .map(|(id, price)| tick(&format!("I{id}"), *price, i64::try_from(n).unwrap_or(0)))
                    .collect();
                for (id, price) in batch {
                    expected.insert(format!("I{id}"), *price);
                }
                snapshot = TickMerger::apply(&snapshot, &ticks);
            }

            prop_assert_eq!(snapshot.len(), expected.len());
            for (id, price) in expected {
                let merged = snapshot.get(&Instrument::new(id)).unwrap();
                prop_assert_eq!(merged.price, Decimal::from(price));
            }
        }
    }
}
