//! Configuration Module
//!
//! Environment-driven configuration for the sync engine.

mod settings;

pub use settings::{ConfigError, PollProfile, ServerSettings, SyncConfig};
