//! Domain Layer - Core synchronization types and pure logic.
//!
//! Nothing here performs I/O or spawns tasks. Every type is plain data with
//! serialization support, and every operation is synchronous.

/// Bounded diagnostic log.
pub mod log;

/// Instruments, ticks, tick merging and forecasts.
pub mod market;

/// Signal derivation from forecast medians.
pub mod signal;

/// Unified state composition.
pub mod state;

/// Desired instrument set tracking.
pub mod subscription;
