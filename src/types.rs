//! Core wallet types shared by the transport and the ledger

use crate::error::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash type: 256-bit transaction identifier
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type (heights, amounts in the smallest unit)
pub type Natural = u64;

/// Decode a 64-character hex txid
pub fn hash_from_hex(s: &str) -> Result<Hash> {
    let bytes = hex::decode(s)?;
    bytes
        .try_into()
        .map_err(|_| WalletError::MalformedPayload(format!("txid must be 32 bytes: {s}")))
}

/// Encode a txid as lowercase hex
pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// OutPoint: (txid, output index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// Canonical `<txid hex>:<index>` key
    pub fn canonical_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash_to_hex(&self.txid), self.index)
    }
}

impl FromStr for OutPoint {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let (txid, index) = s
            .split_once(':')
            .ok_or_else(|| WalletError::MalformedPayload(format!("outpoint key: {s}")))?;
        let index = index
            .parse::<u32>()
            .map_err(|e| WalletError::MalformedPayload(format!("outpoint index {index}: {e}")))?;
        Ok(Self::new(hash_from_hex(txid)?, index))
    }
}

/// Transaction Input: spends `prevout`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
}

/// Transaction Output: value in the smallest currency unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Natural,
    pub script_pubkey: ByteString,
}

/// Transaction as reported by the indexer
///
/// `height` is `None` while the transaction sits in the mempool. A confirmed
/// copy replaces the unconfirmed one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: Hash,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub height: Option<Natural>,
}

impl Transaction {
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }

    /// Outpoint of the output at `index`
    pub fn outpoint(&self, index: usize) -> OutPoint {
        OutPoint::new(self.txid, index as u32)
    }

    /// Iterate `(outpoint, output)` pairs in output order
    pub fn outpoints(&self) -> impl Iterator<Item = (OutPoint, &TransactionOutput)> + '_ {
        self.outputs
            .iter()
            .enumerate()
            .map(move |(i, output)| (self.outpoint(i), output))
    }
}

/// One entry of the initial ownership snapshot: a currently unspent outpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub txid: Hash,
    pub index: u32,
    /// Confirmation height, `None` for mempool outputs
    pub height: Option<Natural>,
}

impl SnapshotEntry {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.index)
    }
}

/// A recent transaction notification
///
/// When the indexer already delivered the body it rides along in `body`
/// and no fetch is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentTransaction {
    pub txid: Hash,
    pub height: Option<Natural>,
    pub body: Option<Transaction>,
}

impl RecentTransaction {
    pub fn new(txid: Hash, height: Option<Natural>) -> Self {
        Self { txid, height, body: None }
    }

    pub fn with_body(tx: Transaction) -> Self {
        Self {
            txid: tx.txid,
            height: tx.height,
            body: Some(tx),
        }
    }
}

/// An output chosen by selection, together with where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedOutput {
    pub outpoint: OutPoint,
    pub output: TransactionOutput,
    /// Derivation path reported by the ownership oracle
    pub path: Option<String>,
}

/// Cached balance totals, recomputed after every ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTotals {
    pub spendable: Natural,
    pub cold_staked: Natural,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outpoint_canonical_key_parses_back() {
        let op = OutPoint::new([0xab; 32], 7);
        let key = op.canonical_key();
        assert!(key.ends_with(":7"));
        assert_eq!(key.parse::<OutPoint>().unwrap(), op);
    }

    #[test]
    fn test_outpoint_rejects_bad_keys() {
        assert!("nocolon".parse::<OutPoint>().is_err());
        assert!("abcd:1".parse::<OutPoint>().is_err());
        assert!(format!("{}:x", "00".repeat(32)).parse::<OutPoint>().is_err());
    }

    #[test]
    fn test_transaction_outpoints() {
        let tx = Transaction {
            txid: [3; 32],
            inputs: vec![],
            outputs: vec![
                TransactionOutput { value: 1, script_pubkey: vec![] },
                TransactionOutput { value: 2, script_pubkey: vec![] },
            ],
            height: None,
        };
        let ops: Vec<_> = tx.outpoints().map(|(op, o)| (op.index, o.value)).collect();
        assert_eq!(ops, vec![(0, 1), (1, 2)]);
        assert!(!tx.is_confirmed());
    }
}
