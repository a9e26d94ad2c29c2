//! Ledger reconciliation
//!
//! The ledger keeps every transaction relevant to the wallet and a status
//! bitset per outpoint. It is fed by an initial snapshot of unspent outpoints
//! and then by batches of recent transactions, fetching bodies through a
//! [`TransactionSource`]. Balances and selections are derived from that
//! record on demand.
//!
//! SPENT is only ever set, never cleared, so batches commute: applying them
//! in any order yields the same spent set.

use crate::config::LedgerConfig;
use crate::error::{Result, WalletError};
use crate::events::{EventBus, WalletEvent};
use crate::oracle::{Classifier, OwnershipOracle};
use crate::status::{OutpointStatus, StatusFlag};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Fetch capability the ledger uses to obtain full transaction bodies
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn fetch_transaction(&self, txid: &Hash) -> Result<Transaction>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LedgerPhase {
    #[default]
    Empty,
    Loading,
    Loaded,
}

/// What one recent-transaction batch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Transactions stored or replaced
    pub stored: usize,
    /// Already known in an equal or better confirmation state
    pub unchanged: usize,
    /// Below the sync high-water mark
    pub stale: usize,
    /// Dropped because their payload could not be used
    pub skipped: usize,
}

/// The ledger's record: plain data, no I/O
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    transactions: BTreeMap<Hash, Transaction>,
    statuses: BTreeMap<OutPoint, OutpointStatus>,
    sync_height: Option<Natural>,
    phase: LedgerPhase,
    epoch: u64,
}

impl LedgerState {
    pub fn phase(&self) -> LedgerPhase {
        self.phase
    }

    /// Highest block height seen in the initial snapshot
    pub fn sync_height(&self) -> Option<Natural> {
        self.sync_height
    }

    pub fn transaction(&self, txid: &Hash) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn status(&self, outpoint: &OutPoint) -> OutpointStatus {
        self.statuses.get(outpoint).copied().unwrap_or_default()
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.status(outpoint).contains(StatusFlag::Spent)
    }

    /// OR `flag` into the outpoint's status
    pub fn mark(&mut self, outpoint: OutPoint, flag: StatusFlag) {
        self.statuses.entry(outpoint).or_default().insert(flag);
    }

    fn clear(&mut self, outpoint: &OutPoint, flag: StatusFlag) {
        if let Some(status) = self.statuses.get_mut(outpoint) {
            status.remove(flag);
            if status.is_empty() {
                self.statuses.remove(outpoint);
            }
        }
    }

    /// Store or replace `tx`, then reflect it in the status map:
    /// its inputs become SPENT and its outputs get their ownership bits.
    pub fn store_transaction(&mut self, tx: Transaction, classifier: &Classifier) {
        let txid = tx.txid;
        let spends: Vec<OutPoint> = tx.inputs.iter().map(|i| i.prevout).collect();
        let ownership: Vec<(OutPoint, OutpointStatus)> = tx
            .outpoints()
            .map(|(op, out)| (op, classifier.classify(&out.script_pubkey).status))
            .filter(|(_, status)| !status.is_empty())
            .collect();

        self.transactions.insert(txid, tx);

        for outpoint in spends {
            self.mark(outpoint, StatusFlag::Spent);
        }
        for (outpoint, status) in ownership {
            *self.statuses.entry(outpoint).or_default() |= status & OutpointStatus::OWNERSHIP;
        }
    }

    /// Unspent outputs passing the shared filters, in ledger order
    fn candidates<'a>(
        &'a self,
        filter: OutpointStatus,
        only_confirmed: bool,
        skip_locked: bool,
        classifier: &'a Classifier,
    ) -> impl Iterator<Item = SelectedOutput> + 'a {
        self.transactions
            .values()
            .filter(move |tx| !only_confirmed || tx.is_confirmed())
            .flat_map(|tx| tx.outpoints())
            .filter(move |(op, _)| {
                let status = self.status(op);
                !status.contains(StatusFlag::Spent)
                    && !(skip_locked && status.contains(StatusFlag::Locked))
            })
            .filter_map(move |(outpoint, output)| {
                let classification = classifier.classify(&output.script_pubkey);
                classification.status.intersects(filter).then(|| SelectedOutput {
                    outpoint,
                    output: output.clone(),
                    path: classification.path,
                })
            })
    }

    pub fn balance(&self, filter: OutpointStatus, classifier: &Classifier) -> Natural {
        let total: u128 = self
            .candidates(filter, false, false, classifier)
            .map(|c| u128::from(c.output.value))
            .sum();
        Natural::try_from(total).unwrap_or(Natural::MAX)
    }

    pub fn select_outputs(
        &self,
        filter: OutpointStatus,
        target: Option<Natural>,
        only_confirmed: bool,
        fee_margin_percent: u64,
        classifier: &Classifier,
    ) -> Vec<SelectedOutput> {
        let mut selected = Vec::new();
        let mut accumulated: u128 = 0;

        for candidate in self.candidates(filter, only_confirmed, true, classifier) {
            accumulated += u128::from(candidate.output.value);
            selected.push(candidate);

            // Stop once accumulated > target * (1 + margin)
            if let Some(target) = target {
                if accumulated * 100 > u128::from(target) * u128::from(100 + fee_margin_percent) {
                    break;
                }
            }
        }
        selected
    }

    pub fn outputs_of_exact_value(
        &self,
        value: Natural,
        filter: OutpointStatus,
        only_confirmed: bool,
        classifier: &Classifier,
    ) -> BTreeMap<String, SelectedOutput> {
        let mut by_path = BTreeMap::new();
        for candidate in self.candidates(filter, only_confirmed, true, classifier) {
            if candidate.output.value != value {
                continue;
            }
            if let Some(path) = candidate.path.clone() {
                by_path.insert(path, candidate);
            }
        }
        by_path
    }

    fn totals(&self, classifier: &Classifier) -> BalanceTotals {
        BalanceTotals {
            spendable: self.balance(OutpointStatus::SPENDABLE, classifier),
            cold_staked: self.balance(OutpointStatus::COLD_STAKED, classifier),
        }
    }
}

/// Ledger shared between the sync driver and its readers
pub struct Ledger {
    state: Mutex<LedgerState>,
    ingest_gate: tokio::sync::Mutex<()>,
    totals: Mutex<BalanceTotals>,
    source: Arc<dyn TransactionSource>,
    classifier: Classifier,
    events: EventBus,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(
        config: LedgerConfig,
        source: Arc<dyn TransactionSource>,
        oracle: Arc<dyn OwnershipOracle>,
        events: EventBus,
    ) -> Self {
        let classifier = Classifier::new(oracle, config.cache_classifications);
        Self {
            state: Mutex::new(LedgerState::default()),
            ingest_gate: tokio::sync::Mutex::new(()),
            totals: Mutex::new(BalanceTotals::default()),
            source,
            classifier,
            events,
            config,
        }
    }

    /// One-time bulk load from the list of currently unspent outpoints.
    ///
    /// Every other output of a fetched transaction is marked SPENT, since the
    /// snapshot lists only what is still unspent.
    pub async fn ingest_initial_snapshot(&self, entries: &[SnapshotEntry]) -> Result<()> {
        let epoch = {
            let mut state = self.state.lock();
            match state.phase {
                LedgerPhase::Loading => {
                    return Err(WalletError::PreconditionViolation(
                        "initial snapshot already in progress".to_string(),
                    ))
                }
                LedgerPhase::Loaded => {
                    return Err(WalletError::PreconditionViolation(
                        "initial snapshot already loaded".to_string(),
                    ))
                }
                LedgerPhase::Empty => {}
            }
            state.phase = LedgerPhase::Loading;
            state.epoch
        };
        info!(entries = entries.len(), "Ingesting initial snapshot");

        let unspent: HashSet<OutPoint> = entries.iter().map(SnapshotEntry::outpoint).collect();
        let snapshot_height = entries.iter().filter_map(|e| e.height).max();

        let mut seen = HashSet::new();
        let txids: Vec<Hash> = entries
            .iter()
            .map(|e| e.txid)
            .filter(|txid| seen.insert(*txid))
            .collect();

        for txid in txids {
            if self.state.lock().transaction(&txid).is_some() {
                continue;
            }

            let tx = match self.fetch_checked(&txid).await {
                Ok(tx) => tx,
                Err(e) => {
                    error!(txid = %hash_to_hex(&txid), error = %e, "Initial snapshot fetch failed");
                    self.abandon_loading(epoch);
                    return Err(e);
                }
            };
            let height = tx.height;

            {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    return Err(WalletError::Aborted(
                        "ledger reset during initial snapshot".to_string(),
                    ));
                }
                let others: Vec<OutPoint> = tx
                    .outpoints()
                    .map(|(op, _)| op)
                    .filter(|op| !unspent.contains(op))
                    .collect();
                state.store_transaction(tx, &self.classifier);
                for outpoint in others {
                    if !state.is_spent(&outpoint) {
                        state.mark(outpoint, StatusFlag::Spent);
                    }
                }
            }
            self.events.emit(WalletEvent::TransactionObserved { txid, height });
        }

        let sync_height = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return Err(WalletError::Aborted(
                    "ledger reset during initial snapshot".to_string(),
                ));
            }
            state.sync_height = state.sync_height.max(snapshot_height);
            state.phase = LedgerPhase::Loaded;
            state.sync_height
        };

        info!(sync_height = ?sync_height, "Initial snapshot loaded");
        self.events.emit(WalletEvent::LedgerLoaded { sync_height });
        self.refresh_totals();
        Ok(())
    }

    /// Apply a batch of recent transactions.
    ///
    /// Does nothing until the initial snapshot has loaded. Transport failures
    /// abort the batch; unusable payloads are logged and skipped.
    pub async fn ingest_recent_transactions(&self, entries: &[RecentTransaction]) -> Result<IngestReport> {
        let _gate = self.ingest_gate.lock().await;
        let mut report = IngestReport::default();

        let (epoch, sync_height) = {
            let state = self.state.lock();
            if state.phase != LedgerPhase::Loaded {
                debug!(entries = entries.len(), phase = ?state.phase, "Ignoring recent transactions before initial load");
                return Ok(report);
            }
            (state.epoch, state.sync_height)
        };

        for entry in entries {
            let txid = entry.txid;
            if let (Some(height), Some(mark)) = (entry.height, sync_height) {
                if height < mark {
                    trace!(txid = %hash_to_hex(&txid), height, mark, "Dropping stale transaction");
                    report.stale += 1;
                    continue;
                }
            }

            let needed = match self.state.lock().transaction(&txid) {
                None => true,
                Some(known) => !known.is_confirmed() && entry.height.is_some(),
            };
            if !needed {
                report.unchanged += 1;
                continue;
            }

            let fetched = match &entry.body {
                Some(body) if body.txid == txid => Ok(body.clone()),
                Some(_) => Err(WalletError::MalformedPayload(
                    "embedded body has a different txid".to_string(),
                )),
                None => self.fetch_checked(&txid).await,
            };
            let mut tx = match fetched {
                Ok(tx) => tx,
                Err(e) if e.is_transport_failure() => {
                    error!(txid = %hash_to_hex(&txid), error = %e, "Recent transaction fetch failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(txid = %hash_to_hex(&txid), error = %e, "Skipping unusable transaction");
                    report.skipped += 1;
                    continue;
                }
            };
            if tx.height.is_none() {
                tx.height = entry.height;
            }
            let height = tx.height;

            {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    return Err(WalletError::Aborted(
                        "ledger reset during recent transaction ingestion".to_string(),
                    ));
                }
                state.store_transaction(tx, &self.classifier);
            }
            report.stored += 1;
            debug!(txid = %hash_to_hex(&txid), height = ?height, "Stored transaction");
            self.events.emit(WalletEvent::TransactionObserved { txid, height });
        }

        if report.stored > 0 {
            self.refresh_totals();
        }
        Ok(report)
    }

    /// Record a transaction this wallet just broadcast
    pub fn record_outgoing_transaction(&self, mut tx: Transaction) -> Result<()> {
        let txid = tx.txid;
        {
            let mut state = self.state.lock();
            if state.phase != LedgerPhase::Loaded {
                return Err(WalletError::PreconditionViolation(
                    "cannot record an outgoing transaction before the initial load".to_string(),
                ));
            }
            if state.transaction(&txid).is_some() {
                return Ok(());
            }
            tx.height = None;
            state.store_transaction(tx, &self.classifier);
        }
        info!(txid = %hash_to_hex(&txid), "Recorded outgoing transaction");
        self.events.emit(WalletEvent::TransactionSent { txid });
        self.refresh_totals();
        Ok(())
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().is_spent(outpoint)
    }

    pub fn status(&self, outpoint: &OutPoint) -> OutpointStatus {
        self.state.lock().status(outpoint)
    }

    pub fn balance(&self, filter: OutpointStatus) -> Natural {
        self.state.lock().balance(filter, &self.classifier)
    }

    /// Unspent, unlocked outputs matching `filter`.
    ///
    /// With a `target` the scan stops once the total exceeds the target plus
    /// the fee margin, so the result is neither minimal nor exhaustive.
    pub fn select_outputs(
        &self,
        filter: OutpointStatus,
        target: Option<Natural>,
        only_confirmed: bool,
    ) -> Vec<SelectedOutput> {
        self.state.lock().select_outputs(
            filter,
            target,
            only_confirmed,
            self.config.fee_margin_percent,
            &self.classifier,
        )
    }

    pub fn outputs_of_exact_value(
        &self,
        value: Natural,
        filter: OutpointStatus,
        only_confirmed: bool,
    ) -> BTreeMap<String, SelectedOutput> {
        self.state
            .lock()
            .outputs_of_exact_value(value, filter, only_confirmed, &self.classifier)
    }

    pub fn lock_outpoint(&self, outpoint: OutPoint) {
        self.state.lock().mark(outpoint, StatusFlag::Locked);
    }

    pub fn unlock_outpoint(&self, outpoint: &OutPoint) {
        self.state.lock().clear(outpoint, StatusFlag::Locked);
    }

    /// Re-derive ownership bits after the wallet's keys changed
    pub fn invalidate_classifications(&self) {
        self.classifier.invalidate();
        {
            let mut state = self.state.lock();
            let owned: Vec<(OutPoint, OutpointStatus)> = state
                .transactions
                .values()
                .flat_map(|tx| tx.outpoints())
                .map(|(op, out)| (op, self.classifier.classify(&out.script_pubkey).status))
                .collect();
            for status in state.statuses.values_mut() {
                *status = *status & !OutpointStatus::OWNERSHIP;
            }
            for (outpoint, status) in owned {
                if !status.is_empty() {
                    *state.statuses.entry(outpoint).or_default() |= status & OutpointStatus::OWNERSHIP;
                }
            }
            state.statuses.retain(|_, status| !status.is_empty());
        }
        self.refresh_totals();
    }

    /// Back to EMPTY, e.g. when switching networks
    pub async fn reset(&self) {
        let _gate = self.ingest_gate.lock().await;
        {
            let mut state = self.state.lock();
            let epoch = state.epoch + 1;
            *state = LedgerState {
                epoch,
                ..LedgerState::default()
            };
        }
        self.classifier.invalidate();
        info!("Ledger reset");
        self.refresh_totals();
    }

    pub fn phase(&self) -> LedgerPhase {
        self.state.lock().phase
    }

    pub fn sync_height(&self) -> Option<Natural> {
        self.state.lock().sync_height
    }

    pub fn transaction(&self, txid: &Hash) -> Option<Transaction> {
        self.state.lock().transaction(txid).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Copy of the full record
    pub fn snapshot(&self) -> LedgerState {
        self.state.lock().clone()
    }

    /// Totals as of the last ingestion
    pub fn totals(&self) -> BalanceTotals {
        *self.totals.lock()
    }

    async fn fetch_checked(&self, txid: &Hash) -> Result<Transaction> {
        let tx = self.source.fetch_transaction(txid).await?;
        if tx.txid != *txid {
            return Err(WalletError::MalformedPayload(format!(
                "asked for {} but received {}",
                hash_to_hex(txid),
                hash_to_hex(&tx.txid)
            )));
        }
        Ok(tx)
    }

    fn abandon_loading(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch && state.phase == LedgerPhase::Loading {
            state.phase = LedgerPhase::Empty;
        }
    }

    fn refresh_totals(&self) {
        let totals = self.state.lock().totals(&self.classifier);
        let changed = {
            let mut cached = self.totals.lock();
            let changed = *cached != totals;
            *cached = totals;
            changed
        };
        if changed {
            debug!(spendable = totals.spendable, cold_staked = totals.cold_staked, "Balance changed");
            self.events.emit(WalletEvent::BalanceChanged(totals));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Classification, ScriptSetOracle};

    const OURS: u8 = 0x51;
    const THEIRS: u8 = 0x52;

    fn tx(id: u8, inputs: Vec<OutPoint>, values: &[(Natural, u8)], height: Option<Natural>) -> Transaction {
        Transaction {
            txid: [id; 32],
            inputs: inputs
                .into_iter()
                .map(|prevout| TransactionInput { prevout, script_sig: vec![] })
                .collect(),
            outputs: values
                .iter()
                .map(|(value, script)| TransactionOutput { value: *value, script_pubkey: vec![*script] })
                .collect(),
            height,
        }
    }

    fn classifier() -> Classifier {
        let oracle = ScriptSetOracle::new();
        oracle.insert(vec![OURS], Classification::basic("m/0/0"));
        Classifier::new(Arc::new(oracle), false)
    }

    #[test]
    fn test_store_marks_inputs_spent_and_ownership() {
        let classifier = classifier();
        let mut state = LedgerState::default();
        let prev = OutPoint::new([9; 32], 1);
        state.store_transaction(tx(1, vec![prev], &[(100, OURS), (50, THEIRS)], Some(10)), &classifier);

        assert!(state.is_spent(&prev));
        let mine = state.status(&OutPoint::new([1; 32], 0));
        assert!(mine.contains(StatusFlag::Ours));
        assert!(mine.contains(StatusFlag::Basic));
        assert!(state.status(&OutPoint::new([1; 32], 1)).is_empty());
    }

    #[test]
    fn test_balance_skips_spent_and_foreign() {
        let classifier = classifier();
        let mut state = LedgerState::default();
        state.store_transaction(tx(1, vec![], &[(100, OURS), (50, THEIRS), (7, OURS)], Some(10)), &classifier);
        state.mark(OutPoint::new([1; 32], 2), StatusFlag::Spent);

        assert_eq!(state.balance(OutpointStatus::SPENDABLE, &classifier), 100);
        assert_eq!(state.balance(OutpointStatus::COLD_STAKED, &classifier), 0);
    }

    #[test]
    fn test_select_stops_past_margin() {
        let classifier = classifier();
        let mut state = LedgerState::default();
        state.store_transaction(tx(1, vec![], &[(60, OURS), (60, OURS), (60, OURS)], Some(1)), &classifier);

        // 60 is not > 110, 120 is
        let picked = state.select_outputs(OutpointStatus::SPENDABLE, Some(100), false, 10, &classifier);
        assert_eq!(picked.len(), 2);

        let all = state.select_outputs(OutpointStatus::SPENDABLE, None, false, 10, &classifier);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_select_respects_confirmation_and_lock() {
        let classifier = classifier();
        let mut state = LedgerState::default();
        state.store_transaction(tx(1, vec![], &[(10, OURS)], None), &classifier);
        state.store_transaction(tx(2, vec![], &[(20, OURS), (30, OURS)], Some(5)), &classifier);
        state.mark(OutPoint::new([2; 32], 1), StatusFlag::Locked);

        let picked = state.select_outputs(OutpointStatus::SPENDABLE, None, true, 10, &classifier);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].output.value, 20);

        // Locked outputs still count towards the balance
        assert_eq!(state.balance(OutpointStatus::SPENDABLE, &classifier), 60);
    }

    #[test]
    fn test_balance_saturates_instead_of_overflowing() {
        let classifier = classifier();
        let mut state = LedgerState::default();
        let half = Natural::MAX / 2 + 1;
        state.store_transaction(tx(1, vec![], &[(half, OURS), (half, OURS)], Some(5)), &classifier);

        assert_eq!(state.balance(OutpointStatus::SPENDABLE, &classifier), Natural::MAX);
    }

    #[test]
    fn test_clear_only_drops_requested_flag() {
        let mut state = LedgerState::default();
        let op = OutPoint::new([4; 32], 0);
        state.mark(op, StatusFlag::Locked);
        state.mark(op, StatusFlag::Spent);
        state.clear(&op, StatusFlag::Locked);
        assert_eq!(state.status(&op), OutpointStatus::SPENT);

        let lone = OutPoint::new([5; 32], 0);
        state.mark(lone, StatusFlag::Locked);
        state.clear(&lone, StatusFlag::Locked);
        assert!(!state.statuses.contains_key(&lone));
    }
}
