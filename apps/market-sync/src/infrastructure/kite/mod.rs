//! Kite Ticker Adapter
//!
//! Implements the live stream transport over Zerodha's Kite ticker:
//!
//! - **Codec**: Binary tick packets and JSON control frames
//! - **Ticker**: WebSocket session with idle detection

pub mod codec;
pub mod ticker;

pub use codec::{CodecError, ControlMessage, KiteCodec, TickMode};
pub use ticker::{KITE_TICKER_URL, KiteTicker, KiteTickerConfig};
