//! Sync Configuration Settings
//!
//! Configuration types for the sync engine, loaded from environment variables.

use std::time::Duration;

use crate::application::services::{
    CoordinatorConfig, DASHBOARD_INTERVAL, DIGEST_INTERVAL, PollingConfig, ReconnectConfig,
};
use crate::domain::market::{Instrument, InstrumentMap};
use crate::domain::state::ResourceKind;
use crate::infrastructure::backend::BackendConfig;
use crate::infrastructure::kite::{KiteTickerConfig, TickMode};

/// Poll cadence preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollProfile {
    /// Interactive dashboard, every 5 seconds.
    #[default]
    Dashboard,
    /// Digest view, every 30 seconds.
    Digest,
}

impl PollProfile {
    /// Parse profile from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "digest" => Self::Digest,
            _ => Self::Dashboard,
        }
    }

    /// Poll interval for this profile.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        match self {
            Self::Dashboard => DASHBOARD_INTERVAL,
            Self::Digest => DIGEST_INTERVAL,
        }
    }

    /// Get the profile name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Digest => "digest",
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for health, metrics and state endpoints.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8090 }
    }
}

/// Complete sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Poll profile the interval defaulted from.
    pub profile: PollProfile,
    /// Dashboard backend client settings.
    pub backend: BackendConfig,
    /// Poll cadence and resources.
    pub polling: PollingConfig,
    /// Kite ticker settings.
    pub ticker: KiteTickerConfig,
    /// Stream retry policy.
    pub reconnect: ReconnectConfig,
    /// Initial stream subscriptions.
    pub instruments: Vec<Instrument>,
    /// Stream token to market key bridge.
    pub aliases: InstrumentMap,
    /// HTTP surface settings.
    pub server: ServerSettings,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Unparseable numbers fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend URL is empty, a resource or tick mode
    /// is unknown, or the request timeout is not shorter than the interval.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let backend = {
            let defaults = BackendConfig::default();
            let base_url = env.get("SYNC_BACKEND_URL").unwrap_or(defaults.base_url);
            if base_url.trim().is_empty() {
                return Err(ConfigError::EmptyValue("SYNC_BACKEND_URL".to_string()));
            }
            BackendConfig {
                base_url,
                timeout: defaults.timeout,
            }
        };

        let profile = env
            .get("SYNC_POLL_PROFILE")
            .map(|s| PollProfile::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let polling_defaults = PollingConfig::default();
        let interval = env.duration_secs("SYNC_POLL_INTERVAL_SECS", profile.interval());
        let request_timeout =
            env.duration_millis("SYNC_REQUEST_TIMEOUT_MS", polling_defaults.request_timeout);
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_POLL_INTERVAL_SECS".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if request_timeout >= interval {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_REQUEST_TIMEOUT_MS".to_string(),
                reason: format!(
                    "{}ms is not shorter than the {}s poll interval",
                    request_timeout.as_millis(),
                    interval.as_secs()
                ),
            });
        }

        let resources = match env.get("SYNC_RESOURCES") {
            Some(list) => parse_resources(&list)?,
            None => polling_defaults.resources,
        };

        let polling = PollingConfig {
            interval,
            request_timeout,
            resources,
        };

        let ticker = {
            let defaults = KiteTickerConfig::default();
            let mode = match env.get("KITE_TICK_MODE") {
                Some(raw) => raw.parse::<TickMode>().map_err(|_| ConfigError::InvalidValue {
                    key: "KITE_TICK_MODE".to_string(),
                    reason: format!("unknown mode {raw:?}"),
                })?,
                None => defaults.mode,
            };
            KiteTickerConfig {
                url: env.get("KITE_TICKER_URL").unwrap_or(defaults.url),
                mode,
                idle_timeout: env
                    .duration_secs("SYNC_STREAM_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
                connect_timeout: defaults.connect_timeout,
            }
        };

        let reconnect = {
            let defaults = ReconnectConfig::default();
            ReconnectConfig {
                initial_delay: env
                    .duration_millis("SYNC_RECONNECT_DELAY_INITIAL_MS", defaults.initial_delay),
                max_delay: env.duration_secs("SYNC_RECONNECT_DELAY_MAX_SECS", defaults.max_delay),
                multiplier: env.parse("SYNC_RECONNECT_DELAY_MULTIPLIER", defaults.multiplier),
                jitter_factor: defaults.jitter_factor,
                max_attempts: env.parse("SYNC_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts),
            }
        };

        let instruments = env
            .get("SYNC_INSTRUMENTS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Instrument::new)
                    .collect()
            })
            .unwrap_or_default();

        let aliases = env
            .get("SYNC_INSTRUMENT_ALIASES")
            .map(|spec| InstrumentMap::parse(&spec))
            .unwrap_or_default();

        let server = ServerSettings {
            http_port: env.parse("SYNC_HTTP_PORT", ServerSettings::default().http_port),
        };

        Ok(Self {
            profile,
            backend,
            polling,
            ticker,
            reconnect,
            instruments,
            aliases,
            server,
        })
    }

    /// Coordinator settings derived from this configuration.
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            polling: self.polling.clone(),
            reconnect: self.reconnect.clone(),
            aliases: self.aliases.clone(),
            instruments: self.instruments.clone(),
            ..CoordinatorConfig::default()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_resources(list: &str) -> Result<Vec<ResourceKind>, ConfigError> {
    let mut resources = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind = item.parse::<ResourceKind>().map_err(|e| ConfigError::InvalidValue {
            key: "SYNC_RESOURCES".to_string(),
            reason: e.to_string(),
        })?;
        if !resources.contains(&kind) {
            resources.push(kind);
        }
    }
    if resources.is_empty() {
        return Err(ConfigError::EmptyValue("SYNC_RESOURCES".to_string()));
    }
    Ok(resources)
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
