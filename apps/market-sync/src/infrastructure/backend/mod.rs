//! Dashboard Backend Adapter
//!
//! REST client for the resources the dashboard polls and the Kite session
//! endpoints used to authenticate the live stream.

mod client;

pub use client::{BackendClient, BackendConfig, BackendError};
