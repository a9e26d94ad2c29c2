//! Drives the ledger from the indexer
//!
//! The initial snapshot comes from `getAccountUtxo`. After that, every new
//! block or reconnect pulls the account history since the last height seen
//! and feeds it to the ledger as recent transactions.

use crate::error::{Result, WalletError};
use crate::events::WalletEvent;
use crate::ledger::{IngestReport, Ledger, LedgerPhase};
use crate::transport::TransportClient;
use crate::types::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

pub struct WalletSync {
    client: TransportClient,
    ledger: Arc<Ledger>,
    descriptor: String,
    page_size: u32,
    last_height: Mutex<Option<Natural>>,
}

impl WalletSync {
    pub fn new(client: TransportClient, ledger: Arc<Ledger>, descriptor: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            ledger,
            descriptor: descriptor.into(),
            page_size,
            last_height: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Load the ledger from the account's current unspent outputs
    pub async fn initial_sync(&self) -> Result<()> {
        let utxos = self.client.get_account_utxo(&self.descriptor).await?;
        let entries = utxos
            .iter()
            .map(|utxo| utxo.to_snapshot_entry())
            .collect::<Result<Vec<_>>>()?;

        self.ledger.ingest_initial_snapshot(&entries).await?;
        *self.last_height.lock() = self.ledger.sync_height();
        info!(descriptor = %self.descriptor, utxos = entries.len(), "Initial sync complete");
        Ok(())
    }

    /// Pull history since the last height seen into the ledger
    pub async fn refresh(&self) -> Result<IngestReport> {
        if self.ledger.phase() != LedgerPhase::Loaded {
            return Ok(IngestReport::default());
        }

        let from = *self.last_height.lock();
        let recent = self
            .client
            .get_account_history(&self.descriptor, from, self.page_size)
            .await?;
        let report = self.ledger.ingest_recent_transactions(&recent).await?;

        if let Some(newest) = recent.iter().filter_map(|r| r.height).max() {
            let mut last = self.last_height.lock();
            *last = (*last).max(Some(newest));
        }
        debug!(
            from = ?from,
            stored = report.stored,
            stale = report.stale,
            skipped = report.skipped,
            "Refreshed account history"
        );
        Ok(report)
    }

    /// Broadcast a signed transaction and record it as ours
    pub async fn broadcast(&self, raw_hex: &str, tx: Transaction) -> Result<Hash> {
        let txid = self.client.send_transaction(raw_hex).await?;
        if txid != tx.txid {
            return Err(WalletError::MalformedPayload(format!(
                "indexer accepted {} but the recorded transaction is {}",
                hash_to_hex(&txid),
                hash_to_hex(&tx.txid)
            )));
        }
        self.ledger.record_outgoing_transaction(tx)?;
        Ok(txid)
    }

    /// React to engine events until the event channel closes
    pub async fn run(&self, mut events: broadcast::Receiver<WalletEvent>) -> Result<()> {
        loop {
            match events.recv().await {
                Ok(WalletEvent::NewBlock { height, .. }) => {
                    debug!(height, "New block");
                    self.refresh_logged().await;
                }
                Ok(WalletEvent::ConnectionToggled { connected: true, endpoint }) => {
                    debug!(endpoint = %endpoint, "Connection up, catching up");
                    if self.ledger.phase() == LedgerPhase::Empty {
                        if let Err(e) = self.initial_sync().await {
                            warn!(error = %e, "Initial sync failed, will retry on next event");
                        }
                    } else {
                        self.refresh_logged().await;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Sync lagged behind events, refreshing");
                    self.refresh_logged().await;
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh().await {
            warn!(descriptor = %self.descriptor, error = %e, "Refresh failed, will retry on next event");
        }
    }
}
