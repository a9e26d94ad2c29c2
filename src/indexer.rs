//! Typed calls against the indexer and decoding of its payloads
//!
//! Amounts arrive either as strings of smallest units (`"150000"`) or as
//! coin-denominated decimals (`"1.5"`, `1.5`). Both are turned into integer
//! units here and nowhere else.

use crate::constants::*;
use crate::error::{Result, WalletError};
use crate::ledger::TransactionSource;
use crate::transport::TransportClient;
use crate::types::*;
use crate::wire::ensure_no_application_error;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Indexer status from `getInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexerInfo {
    pub name: String,
    pub shortcut: String,
    pub decimals: u32,
    pub version: String,
    pub best_height: Natural,
    pub best_hash: String,
    pub testnet: bool,
}

/// One unspent output from `getAccountUtxo`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUtxo {
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
    pub value: Value,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub path: Option<String>,
}

impl AccountUtxo {
    pub fn value_units(&self) -> Result<Natural> {
        parse_amount(&self.value)
    }

    pub fn to_snapshot_entry(&self) -> Result<SnapshotEntry> {
        Ok(SnapshotEntry {
            txid: hash_from_hex(&self.txid)?,
            index: self.vout,
            height: confirmed_height(self.height),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AccountInfoPage {
    page: u32,
    total_pages: u32,
    transactions: Vec<Value>,
}

/// Heights reported as zero or negative mean the mempool
fn confirmed_height(height: Option<i64>) -> Option<Natural> {
    height.filter(|h| *h > 0).map(|h| h as Natural)
}

/// Convert a coin-denominated decimal such as `"1.5"` into smallest units
pub fn coins_to_units(text: &str) -> Result<Natural> {
    let malformed = || WalletError::MalformedPayload(format!("invalid amount: {text}"));

    let (whole, fraction) = text.trim().split_once('.').unwrap_or((text.trim(), ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(malformed());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }

    // Digits past the unit precision must be zero
    let (kept, extra) = fraction.split_at(fraction.len().min(COIN_DECIMALS));
    if extra.chars().any(|c| c != '0') {
        return Err(malformed());
    }

    let whole: Natural = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| malformed())? };
    let fraction: Natural = format!("{kept:0<width$}", width = COIN_DECIMALS)
        .parse()
        .map_err(|_| malformed())?;

    whole
        .checked_mul(UNITS_PER_COIN)
        .and_then(|units| units.checked_add(fraction))
        .ok_or_else(malformed)
}

/// Decode an amount field
///
/// Strings of digits are smallest units. Strings with a decimal point and
/// JSON numbers are coin-denominated.
pub fn parse_amount(value: &Value) -> Result<Natural> {
    match value {
        Value::String(text) if text.contains('.') => coins_to_units(text),
        Value::String(text) => text
            .parse()
            .map_err(|_| WalletError::MalformedPayload(format!("invalid amount: {text}"))),
        Value::Number(number) => {
            let text = number.to_string();
            if text.contains(|c: char| c == 'e' || c == 'E') {
                let units = number
                    .as_f64()
                    .map(|coins| (coins * UNITS_PER_COIN as f64).round())
                    .filter(|units| units.is_finite() && *units >= 0.0 && *units < Natural::MAX as f64)
                    .ok_or_else(|| WalletError::MalformedPayload(format!("invalid amount: {text}")))?;
                Ok(units as Natural)
            } else {
                coins_to_units(&text)
            }
        }
        other => Err(WalletError::MalformedPayload(format!("invalid amount: {other}"))),
    }
}

fn decode_script(entry: &Value) -> Result<ByteString> {
    match entry.get("hex").and_then(Value::as_str) {
        Some(hex_script) => Ok(hex::decode(hex_script)?),
        None => Ok(Vec::new()),
    }
}

/// Decode one transaction object as returned by `getTransaction` or inside
/// `getAccountInfo` pages
pub fn parse_transaction(value: &Value) -> Result<Transaction> {
    let txid = value
        .get("txid")
        .and_then(Value::as_str)
        .ok_or_else(|| WalletError::MalformedPayload("transaction without txid".to_string()))?;
    let txid = hash_from_hex(txid)?;

    let mut inputs = Vec::new();
    for vin in value.get("vin").and_then(Value::as_array).into_iter().flatten() {
        // Coinbase inputs carry no previous output
        let Some(prev_txid) = vin.get("txid").and_then(Value::as_str) else {
            continue;
        };
        let index = vin.get("vout").and_then(Value::as_u64).unwrap_or(0);
        let index = u32::try_from(index)
            .map_err(|_| WalletError::MalformedPayload(format!("input index {index} out of range")))?;
        inputs.push(TransactionInput {
            prevout: OutPoint::new(hash_from_hex(prev_txid)?, index),
            script_sig: decode_script(vin)?,
        });
    }

    let mut outputs: Vec<(u64, TransactionOutput)> = Vec::new();
    for (position, vout) in value
        .get("vout")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let n = vout.get("n").and_then(Value::as_u64).unwrap_or(position as u64);
        let amount = vout.get("value").cloned().unwrap_or_default();
        outputs.push((
            n,
            TransactionOutput {
                value: parse_amount(&amount)?,
                script_pubkey: decode_script(vout)?,
            },
        ));
    }
    outputs.sort_by_key(|(n, _)| *n);
    if outputs.iter().enumerate().any(|(i, (n, _))| *n != i as u64) {
        return Err(WalletError::MalformedPayload(format!(
            "transaction {} has gaps in its output indexes",
            hash_to_hex(&txid)
        )));
    }

    Ok(Transaction {
        txid,
        inputs,
        outputs: outputs.into_iter().map(|(_, o)| o).collect(),
        height: confirmed_height(value.get("blockHeight").and_then(Value::as_i64)),
    })
}

/// Turn one history entry into a recent-transaction notification.
///
/// An entry whose body cannot be decoded is still passed on by txid, so the
/// ledger can fetch it on its own.
fn recent_from_history(entry: &Value) -> Option<RecentTransaction> {
    match parse_transaction(entry) {
        Ok(tx) => Some(RecentTransaction::with_body(tx)),
        Err(e) => {
            let txid = entry.get("txid").and_then(Value::as_str)?;
            let txid = hash_from_hex(txid).ok()?;
            warn!(txid = %hash_to_hex(&txid), error = %e, "History entry body unusable, will fetch");
            let height = confirmed_height(entry.get("blockHeight").and_then(Value::as_i64));
            Some(RecentTransaction::new(txid, height))
        }
    }
}

impl TransportClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let data = self.send_and_wait_for_answer(method, params).await?;
        ensure_no_application_error(&data)?;
        Ok(data)
    }

    pub async fn get_info(&self) -> Result<IndexerInfo> {
        let data = self.call(METHOD_GET_INFO, json!({})).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Unspent outputs of an xpub or address
    pub async fn get_account_utxo(&self, descriptor: &str) -> Result<Vec<AccountUtxo>> {
        let data = self
            .call(METHOD_GET_ACCOUNT_UTXO, json!({ "descriptor": descriptor }))
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Every transaction of `descriptor` from block `from` on, across all pages
    pub async fn get_account_history(
        &self,
        descriptor: &str,
        from: Option<Natural>,
        page_size: u32,
    ) -> Result<Vec<RecentTransaction>> {
        let mut recent = Vec::new();
        let mut page = 1u32;
        loop {
            let mut params = json!({
                "descriptor": descriptor,
                "details": "txs",
                "page": page,
                "pageSize": page_size,
            });
            if let Some(from) = from {
                params["from"] = json!(from);
            }

            let data = self.call(METHOD_GET_ACCOUNT_INFO, params).await?;
            let info: AccountInfoPage = serde_json::from_value(data)?;
            recent.extend(info.transactions.iter().filter_map(recent_from_history));
            debug!(descriptor, page = info.page, total_pages = info.total_pages, "Fetched history page");

            if info.page == 0 || info.page >= info.total_pages {
                break;
            }
            page = info.page + 1;
        }
        Ok(recent)
    }

    pub async fn get_transaction(&self, txid: &Hash) -> Result<Transaction> {
        let data = self
            .call(METHOD_GET_TRANSACTION, json!({ "txid": hash_to_hex(txid) }))
            .await?;
        parse_transaction(&data)
    }

    /// Broadcast a fully signed raw transaction, returning its txid
    pub async fn send_transaction(&self, raw_hex: &str) -> Result<Hash> {
        let data = self
            .call(METHOD_SEND_TRANSACTION, json!({ "hex": raw_hex }))
            .await?;
        let txid = data
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| WalletError::MalformedPayload("sendTransaction without result".to_string()))?;
        hash_from_hex(txid)
    }
}

#[async_trait]
impl TransactionSource for TransportClient {
    async fn fetch_transaction(&self, txid: &Hash) -> Result<Transaction> {
        self.get_transaction(txid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_units() {
        assert_eq!(coins_to_units("1.5").unwrap(), 150_000_000);
        assert_eq!(coins_to_units("0.00000001").unwrap(), 1);
        assert_eq!(coins_to_units("5").unwrap(), 500_000_000);
        assert_eq!(coins_to_units(".25").unwrap(), 25_000_000);
        assert_eq!(coins_to_units("2.1000000000").unwrap(), 210_000_000);
        assert!(coins_to_units("0.000000001").is_err());
        assert!(coins_to_units("-1").is_err());
        assert!(coins_to_units("abc").is_err());
        assert!(coins_to_units(".").is_err());
    }

    #[test]
    fn test_parse_amount_forms() {
        assert_eq!(parse_amount(&json!("150000")).unwrap(), 150_000);
        assert_eq!(parse_amount(&json!("0.0015")).unwrap(), 150_000);
        assert_eq!(parse_amount(&json!(0.0015)).unwrap(), 150_000);
        assert_eq!(parse_amount(&json!(1e-8)).unwrap(), 1);
        assert_eq!(parse_amount(&json!(3)).unwrap(), 300_000_000);
        assert!(parse_amount(&json!(null)).is_err());
    }

    #[test]
    fn test_out_of_range_amounts_rejected() {
        assert!(matches!(parse_amount(&json!(1e30)), Err(WalletError::MalformedPayload(_))));
        assert!(matches!(parse_amount(&json!(-2e-8)), Err(WalletError::MalformedPayload(_))));
        assert!(matches!(parse_amount(&json!(2e11)), Err(WalletError::MalformedPayload(_))));
        assert_eq!(parse_amount(&json!(2.1e7)).unwrap(), 2_100_000_000_000_000);
    }

    #[test]
    fn test_parse_transaction() {
        let prev = "11".repeat(32);
        let txid = "22".repeat(32);
        let value = json!({
            "txid": txid,
            "blockHeight": 120,
            "vin": [
                {"txid": prev, "n": 0, "hex": "00"},
                {"txid": prev, "vout": 3, "n": 1}
            ],
            "vout": [
                {"value": "1000", "n": 1, "hex": "51"},
                {"value": "2000", "n": 0, "hex": "52"}
            ]
        });

        let tx = parse_transaction(&value).unwrap();
        assert_eq!(tx.txid, [0x22; 32]);
        assert_eq!(tx.height, Some(120));
        assert_eq!(tx.inputs[0].prevout, OutPoint::new([0x11; 32], 0));
        assert_eq!(tx.inputs[0].script_sig, vec![0x00]);
        assert_eq!(tx.inputs[1].prevout.index, 3);
        assert_eq!(tx.outputs[0].value, 2000);
        assert_eq!(tx.outputs[1].script_pubkey, vec![0x51]);
    }

    #[test]
    fn test_mempool_and_coinbase() {
        let value = json!({
            "txid": "33".repeat(32),
            "blockHeight": -1,
            "vin": [{"coinbase": "abcd"}],
            "vout": [{"value": "5000000000", "n": 0, "hex": "51"}]
        });
        let tx = parse_transaction(&value).unwrap();
        assert!(tx.height.is_none());
        assert!(tx.inputs.is_empty());
    }

    #[test]
    fn test_malformed_transactions_rejected() {
        assert!(parse_transaction(&json!({"vin": []})).is_err());
        assert!(parse_transaction(&json!({"txid": "zz"})).is_err());
        let gap = json!({"txid": "44".repeat(32), "vout": [{"value": "1", "n": 2}]});
        assert!(parse_transaction(&gap).is_err());

        let wide_index = json!({
            "txid": "44".repeat(32),
            "vin": [{"txid": "11".repeat(32), "vout": u64::from(u32::MAX) + 1}],
            "vout": [{"value": "1", "n": 0}]
        });
        assert!(matches!(parse_transaction(&wide_index), Err(WalletError::MalformedPayload(_))));
    }

    #[test]
    fn test_account_utxo_snapshot_entry() {
        let utxo: AccountUtxo = serde_json::from_value(json!({
            "txid": "55".repeat(32),
            "vout": 2,
            "value": "500000000",
            "height": 0,
            "confirmations": 0
        }))
        .unwrap();
        let entry = utxo.to_snapshot_entry().unwrap();
        assert_eq!(entry.index, 2);
        assert!(entry.height.is_none());
        assert_eq!(utxo.value_units().unwrap(), 500_000_000);
    }

    #[test]
    fn test_history_entry_without_body_falls_back_to_txid() {
        let entry = json!({"txid": "66".repeat(32), "blockHeight": 7, "vout": [{"value": {}}]});
        let recent = recent_from_history(&entry).unwrap();
        assert!(recent.body.is_none());
        assert_eq!(recent.height, Some(7));
        assert!(recent_from_history(&json!({"bogus": true})).is_none());
    }
}
