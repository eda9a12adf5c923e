//! Trading Signal Derivation
//!
//! Maps the median (`p50`) of a quantile forecast onto a discrete signal.
//! The function is pure and total: every input, including a missing or
//! non-finite forecast, yields a signal.
//!
//! # Tiers
//!
//! - **Banner** (coarse): `|p50| > 0.005` → `STRONG_BUY` / `STRONG_SELL`
//! - **Indicator** (fine): `|p50| > 0.001` → `BUY` / `SELL`
//!
//! A value exactly on a cut point stays on the neutral side.

use serde::{Deserialize, Serialize};

use crate::domain::market::QuantileForecast;

/// Discrete trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    /// Expected move beyond the strong-buy cut.
    StrongBuy,
    /// Expected move beyond the buy cut.
    Buy,
    /// Expected move inside the neutral band.
    Neutral,
    /// Expected move beyond the sell cut.
    Sell,
    /// Expected move beyond the strong-sell cut.
    StrongSell,
    /// No usable forecast.
    Wait,
}

impl Signal {
    /// Display label used by the dashboard.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StrongBuy => "STRONG_BUY",
            Self::Buy => "BUY",
            Self::Neutral => "NEUTRAL",
            Self::Sell => "SELL",
            Self::StrongSell => "STRONG_SELL",
            Self::Wait => "WAIT",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered cut points on `p50`.
///
/// Unset cut points are skipped, so a tier can emit only strong signals or
/// only plain ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThresholds {
    /// `p50` strictly above this is `STRONG_BUY`.
    pub strong_buy: Option<f64>,
    /// `p50` strictly above this is `BUY`.
    pub buy: Option<f64>,
    /// `p50` strictly below this is `SELL`.
    pub sell: Option<f64>,
    /// `p50` strictly below this is `STRONG_SELL`.
    pub strong_sell: Option<f64>,
}

impl SignalThresholds {
    /// Coarse tier used for the prominent banner signal.
    pub const BANNER: Self = Self::symmetric_strong(0.005);

    /// Fine tier used for the compact per-instrument indicator.
    pub const INDICATOR: Self = Self::symmetric(0.001);

    /// Plain buy/sell tier with a symmetric neutral band of `±band`.
    #[must_use]
    pub const fn symmetric(band: f64) -> Self {
        Self {
            strong_buy: None,
            buy: Some(band),
            sell: Some(-band),
            strong_sell: None,
        }
    }

    /// Strong-only tier with a symmetric neutral band of `±band`.
    #[must_use]
    pub const fn symmetric_strong(band: f64) -> Self {
        Self {
            strong_buy: Some(band),
            buy: None,
            sell: None,
            strong_sell: Some(-band),
        }
    }
}

/// Derive a signal from a forecast median.
#[must_use]
pub fn derive(p50: Option<f64>, thresholds: &SignalThresholds) -> Signal {
    let Some(p50) = p50.filter(|v| v.is_finite()) else {
        return Signal::Wait;
    };

    let above = |cut: Option<f64>| cut.is_some_and(|c| p50 > c);
    let below = |cut: Option<f64>| cut.is_some_and(|c| p50 < c);

    if above(thresholds.strong_buy) {
        Signal::StrongBuy
    } else if above(thresholds.buy) {
        Signal::Buy
    } else if below(thresholds.strong_sell) {
        Signal::StrongSell
    } else if below(thresholds.sell) {
        Signal::Sell
    } else {
        Signal::Neutral
    }
}

/// Banner and indicator signals for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstrumentSignals {
    /// Coarse tier.
    pub banner: Signal,
    /// Fine tier.
    pub indicator: Signal,
}

impl InstrumentSignals {
    /// Both tiers waiting on a forecast.
    pub const WAIT: Self = Self {
        banner: Signal::Wait,
        indicator: Signal::Wait,
    };

    /// Derive both tiers from the latest forecast step, if any.
    #[must_use]
    pub fn from_forecast(forecast: Option<&QuantileForecast>) -> Self {
        let p50 = forecast.map(|f| f.p50);
        Self {
            banner: derive(p50, &SignalThresholds::BANNER),
            indicator: derive(p50, &SignalThresholds::INDICATOR),
        }
    }
}
