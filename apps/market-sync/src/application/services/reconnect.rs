//! Reconnection Policy
//!
//! Bounded exponential backoff with jitter for the push stream. The policy
//! counts consecutive failed attempts, including the first connect, and stops
//! handing out delays once the budget is spent.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor per failure (e.g., 2.0 doubles the delay).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Failed attempts allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

/// Reconnection policy implementing bounded exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use market_sync::application::services::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     max_attempts: 2,
///     jitter_factor: 0.0,
///     ..ReconnectConfig::default()
/// });
///
/// // First failure: retry after the initial delay
/// assert_eq!(policy.on_failure(), Some(Duration::from_secs(5)));
///
/// // Second failure spends the budget
/// assert_eq!(policy.on_failure(), None);
/// assert!(policy.is_exhausted());
///
/// // A successful connection or a manual reconnect starts over
/// policy.reset();
/// assert!(!policy.is_exhausted());
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    failures: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            failures: 0,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    ///
    /// Returns `None` once `max_attempts` failures have been recorded.
    #[must_use]
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);

        if self.is_exhausted() {
            return None;
        }

        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay.min(self.config.max_delay))
    }

    /// Reset after a successful connection or a manual reconnect.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Configured failure budget (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether the failure budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.failures >= self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        })
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn exponential_backoff() {
        let mut policy = fixed(100, 10_000, 2.0, 0);

        assert_eq!(policy.on_failure(), Some(Duration::from_millis(100)));
        assert_eq!(policy.on_failure(), Some(Duration::from_millis(200)));
        assert_eq!(policy.on_failure(), Some(Duration::from_millis(400)));
        assert_eq!(policy.on_failure(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn max_delay_cap() {
        let mut policy = fixed(1000, 2000, 4.0, 0);

        let _ = policy.on_failure();
        assert_eq!(policy.on_failure(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.on_failure(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn three_failures_spend_budget_of_three() {
        let mut policy = fixed(100, 1000, 2.0, 3);

        assert!(policy.on_failure().is_some());
        assert!(policy.on_failure().is_some());
        assert_eq!(policy.failures(), 2);
        assert!(!policy.is_exhausted());

        assert!(policy.on_failure().is_none());
        assert!(policy.is_exhausted());
        assert!(policy.on_failure().is_none());
    }

    #[test]
    fn reset_restores_budget_and_delay() {
        let mut policy = fixed(100, 10_000, 2.0, 3);
        let _ = policy.on_failure();
        let _ = policy.on_failure();

        policy.reset();

        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.on_failure(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });

            let millis = policy.on_failure().unwrap().as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn unlimited_attempts() {
        let mut policy = fixed(1, 10, 2.0, 0);
        for _ in 0..1000 {
            assert!(policy.on_failure().is_some());
        }
        assert!(!policy.is_exhausted());
    }
}
