//! # Wallet-Sync
//!
//! Wallet engine that keeps a local ledger of outpoints in step with a
//! Blockbook-style indexer reached over a websocket.
//!
//! ## Architecture
//!
//! The system is split into two halves joined by a single seam:
//! - Transport client (request/answer correlation, subscriptions, reconnects)
//! - Ledger state (transactions, per-outpoint status bits, balances, selection)
//! - [`sync::WalletSync`] feeding indexer answers into the ledger
//!
//! ## Design Principles
//!
//! 1. **Stale data never wins**: replies from a replaced connection and
//!    transactions below the sync height are dropped
//! 2. **Status is a bitset**: ownership kind, spent and locked combine freely
//! 3. **Ownership is pluggable**: the ledger only asks an [`oracle::OwnershipOracle`]
//! 4. **Transport failures propagate**: a partially applied snapshot is never
//!    reported as loaded
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use wallet_sync::{LedgerPhase, MemoryConnector, ScriptSetOracle, WalletConfig, WalletEngine};
//!
//! let config = WalletConfig {
//!     endpoints: vec!["ws://indexer.local/websocket".to_string()],
//!     ..WalletConfig::default()
//! };
//! let connector = Arc::new(MemoryConnector::new(|_, _| vec![]));
//! let engine = WalletEngine::new(config, connector, Arc::new(ScriptSetOracle::new())).unwrap();
//!
//! assert_eq!(engine.ledger().phase(), LedgerPhase::Empty);
//! assert_eq!(engine.ledger().totals().spendable, 0);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod logging;
pub mod events;
pub mod status;
pub mod wire;
pub mod transport;
pub mod oracle;
pub mod ledger;
pub mod indexer;
pub mod sync;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{Result, WalletError};
pub use config::{ClientConfig, LedgerConfig, ReconnectConfig, WalletConfig};
pub use events::{EventBus, WalletEvent};
pub use status::{OutpointStatus, StatusFlag};
pub use transport::{
    ConnectionHandle, ConnectionState, Connector, MemoryConnector, RoundRobinEndpoints,
    TransportClient, WebSocketConnector,
};
pub use oracle::{Classification, OwnershipOracle, ScriptSetOracle};
pub use ledger::{IngestReport, Ledger, LedgerPhase, LedgerState, TransactionSource};
pub use sync::WalletSync;

use std::sync::Arc;
use tokio::sync::broadcast;

/// Transport client and ledger wired together
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use wallet_sync::{Classification, ScriptSetOracle, WalletConfig, WalletEngine, WebSocketConnector};
///
/// let oracle = Arc::new(ScriptSetOracle::new());
/// oracle.insert(vec![0x51], Classification::basic("m/0/0"));
///
/// let engine = WalletEngine::with_websocket(WalletConfig::default(), oracle).unwrap();
/// assert!(engine.client().endpoint().is_none());
/// ```
pub struct WalletEngine {
    config: WalletConfig,
    events: EventBus,
    client: TransportClient,
    ledger: Arc<Ledger>,
}

impl WalletEngine {
    /// Build an engine over `connector`, validating `config` first
    pub fn new(
        config: WalletConfig,
        connector: Arc<dyn Connector>,
        oracle: Arc<dyn OwnershipOracle>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new();
        let rotation = RoundRobinEndpoints::new(config.endpoints.clone());
        let client = TransportClient::new(
            config.client.clone(),
            connector,
            Box::new(rotation),
            events.clone(),
        );
        let ledger = Arc::new(Ledger::new(
            config.ledger.clone(),
            Arc::new(client.clone()),
            oracle,
            events.clone(),
        ));

        Ok(Self {
            config,
            events,
            client,
            ledger,
        })
    }

    pub fn with_websocket(config: WalletConfig, oracle: Arc<dyn OwnershipOracle>) -> Result<Self> {
        Self::new(config, Arc::new(WebSocketConnector::new()), oracle)
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn client(&self) -> &TransportClient {
        &self.client
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Connect to the first configured endpoint
    pub async fn connect(&self) -> Result<ConnectionHandle> {
        let endpoint = self.config.endpoints.first().ok_or_else(|| {
            WalletError::Configuration("no indexer endpoints configured".to_string())
        })?;
        self.client.connect(endpoint).await
    }

    /// Sync driver for the account behind `descriptor`
    pub fn sync_for(&self, descriptor: impl Into<String>) -> WalletSync {
        WalletSync::new(
            self.client.clone(),
            Arc::clone(&self.ledger),
            descriptor,
            self.config.history_page_size,
        )
    }
}
