//! Coordinator Ingress Events
//!
//! Everything the polling loop and the stream connection report to the
//! coordinator travels as one of these, over a single queue.

use crate::domain::log::LogKind;
use crate::domain::market::{Instrument, Tick};
use crate::domain::state::{ConnectionState, PollSnapshot};

use super::polling::PollFailure;

/// A delta for the coordinator to apply.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Every resource of a poll cycle succeeded.
    PollCommitted(PollSnapshot),
    /// At least one resource of a poll cycle failed. Nothing is committed.
    PollFailed(PollFailure),
    /// Ticks from the live stream, in arrival order.
    Ticks(Vec<Tick>),
    /// An instrument left the desired set. Its last tick no longer applies.
    Unwatched(Instrument),
    /// Stream lifecycle transition.
    Connection(ConnectionState),
    /// Diagnostic line for the log buffer.
    Log {
        /// Message text.
        message: String,
        /// Entry kind.
        kind: LogKind,
    },
}

impl SyncEvent {
    /// Build a log event.
    #[must_use]
    pub fn log(message: impl Into<String>, kind: LogKind) -> Self {
        Self::Log {
            message: message.into(),
            kind,
        }
    }
}
