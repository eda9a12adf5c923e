//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `AuthTokenResolver`: Fetches stream credentials once per connect attempt
//! - `StreamConnection`: Push transport lifecycle with bounded reconnect
//! - `PollingSynchronizer`: Periodic all-or-nothing REST fetch
//! - `StateCoordinator`: Sole writer and publisher of the unified state

pub mod auth;
pub mod coordinator;
pub mod events;
pub mod polling;
pub mod reconnect;
pub mod stream;

pub use auth::AuthTokenResolver;
pub use coordinator::{CoordinatorConfig, CoordinatorState, StateCoordinator};
pub use events::SyncEvent;
pub use polling::{DASHBOARD_INTERVAL, DIGEST_INTERVAL, PollFailure, PollingConfig, PollingSynchronizer};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use stream::{StreamCommand, StreamConnection, StreamHandle};
