//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the synchronization services and the port interfaces
//! that define how they reach the backend and the push transport.

/// Port interfaces for external systems (stream transport, REST backend).
pub mod ports;

/// Synchronization services: polling, stream lifecycle, state coordination.
pub mod services;
