//! Subscription Management Types
//!
//! Tracks the set of instruments the caller wants ticks for and reconciles it
//! against the stream's connection state.
//!
//! # Design
//!
//! The desired set is independent of the connection. It survives drops and
//! reconnects untouched:
//! - While the stream is live, a set mutation yields the upstream change to
//!   push immediately
//! - While it is not, mutations are only recorded
//! - On every (re)connect the whole desired set is replayed, never a diff
//!
//! Both the set and the live flag sit behind one lock, so an instrument added
//! concurrently with a connect lands either in the replay or in a change,
//! never in neither.

use std::collections::BTreeSet;

use parking_lot::RwLock;

use crate::domain::market::Instrument;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to upstream subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Instruments to subscribe to.
    pub subscribe: Vec<Instrument>,
    /// Instruments to unsubscribe from.
    pub unsubscribe: Vec<Instrument>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            subscribe: instruments.into_iter().collect(),
            unsubscribe: Vec::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            subscribe: Vec::new(),
            unsubscribe: instruments.into_iter().collect(),
        }
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

#[derive(Debug, Default)]
struct SubscriptionState {
    desired: BTreeSet<Instrument>,
    live: bool,
}

/// Desired instrument set, reconciled against connection state.
///
/// # Example
///
/// ```rust
/// use market_sync::domain::subscription::SubscriptionManager;
///
/// let manager = SubscriptionManager::new();
///
/// // Not connected yet: recorded, nothing to push
/// assert!(manager.add_instrument("A".into()).is_none());
/// assert!(manager.add_instrument("B".into()).is_none());
///
/// // Connect replays the whole set
/// let replay = manager.on_connected();
/// assert_eq!(replay.len(), 2);
///
/// // Live: the change is pushed right away
/// let changes = manager.add_instrument("C".into()).unwrap();
/// assert_eq!(changes.subscribe, vec!["C".into()]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    state: RwLock<SubscriptionState>,
}

impl SubscriptionManager {
    /// Create an empty subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager seeded with an initial desired set.
    #[must_use]
    pub fn with_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            state: RwLock::new(SubscriptionState {
                desired: instruments.into_iter().collect(),
                live: false,
            }),
        }
    }

    /// Add an instrument to the desired set.
    ///
    /// Returns the upstream change only when the stream is live and the
    /// instrument was not already desired.
    pub fn add_instrument(&self, instrument: Instrument) -> Option<SubscriptionChanges> {
        let mut state = self.state.write();
        let inserted = state.desired.insert(instrument.clone());

        (inserted && state.live).then(|| SubscriptionChanges::subscribe_only([instrument]))
    }

    /// Remove an instrument from the desired set.
    ///
    /// Returns the upstream change only when the stream is live and the
    /// instrument was desired.
    pub fn remove_instrument(&self, instrument: &Instrument) -> Option<SubscriptionChanges> {
        let mut state = self.state.write();
        let removed = state.desired.remove(instrument);

        (removed && state.live).then(|| SubscriptionChanges::unsubscribe_only([instrument.clone()]))
    }

    /// Mark the stream live and return the full set to replay.
    pub fn on_connected(&self) -> Vec<Instrument> {
        let mut state = self.state.write();
        state.live = true;
        state.desired.iter().cloned().collect()
    }

    /// Mark the stream down. The desired set is kept.
    pub fn on_disconnected(&self) {
        self.state.write().live = false;
    }

    /// Whether changes are currently pushed upstream.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.read().live
    }

    /// Snapshot of the desired set in instrument order.
    #[must_use]
    pub fn desired(&self) -> Vec<Instrument> {
        self.state.read().desired.iter().cloned().collect()
    }

    /// Whether an instrument is desired.
    #[must_use]
    pub fn contains(&self, instrument: &Instrument) -> bool {
        self.state.read().desired.contains(instrument)
    }

    /// Number of desired instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().desired.len()
    }

    /// Whether the desired set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().desired.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
