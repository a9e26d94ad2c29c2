//! High-level events emitted by the engine
//!
//! Delivery is fire-and-forget over a broadcast channel. A subscriber that
//! falls behind loses the oldest events, never blocks the engine.

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::types::{BalanceTotals, Hash, Natural};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// The initial snapshot finished loading
    LedgerLoaded { sync_height: Option<Natural> },
    /// Balance totals changed after an ingestion
    BalanceChanged(BalanceTotals),
    /// A transaction was stored or replaced by a newer copy
    TransactionObserved { txid: Hash, height: Option<Natural> },
    /// A locally broadcast transaction was recorded
    TransactionSent { txid: Hash },
    /// The transport connection opened or dropped
    ConnectionToggled { connected: bool, endpoint: String },
    /// The indexer announced a new block
    NewBlock { height: Natural, hash: String },
}

/// Cloneable handle to the shared event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: WalletEvent) {
        // No receivers is not an error for fire-and-forget delivery
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(?event, "event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
