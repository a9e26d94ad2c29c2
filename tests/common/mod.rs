//! Shared fixtures: a scripted indexer behind the in-memory connector

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use wallet_sync::wire::WireRequest;
use wallet_sync::*;

pub const PRIMARY: &str = "ws://primary.test/websocket";
pub const BACKUP: &str = "ws://backup.test/websocket";

/// Scripts the test oracle knows about
pub const OURS: &str = "51";
pub const OURS_ALT: &str = "0051";
pub const COLD: &str = "53";
pub const THEIRS: &str = "52";

pub fn txid(n: u8) -> Hash {
    [n; 32]
}

pub fn txid_hex(n: u8) -> String {
    hash_to_hex(&txid(n))
}

pub fn oracle() -> Arc<ScriptSetOracle> {
    let oracle = ScriptSetOracle::new();
    oracle.insert(hex::decode(OURS).unwrap(), Classification::basic("m/0/0"));
    oracle.insert(hex::decode(OURS_ALT).unwrap(), Classification::basic("m/0/1"));
    oracle.insert(hex::decode(COLD).unwrap(), Classification::cold_stake("m/1/0"));
    Arc::new(oracle)
}

/// Transaction body as the indexer would return it
pub fn tx_json(id: u8, inputs: &[(u8, u32)], outputs: &[(Natural, &str)], height: i64) -> Value {
    let vin: Vec<Value> = inputs
        .iter()
        .map(|(prev, vout)| json!({ "txid": txid_hex(*prev), "vout": vout }))
        .collect();
    let vout: Vec<Value> = outputs
        .iter()
        .enumerate()
        .map(|(n, (value, script))| json!({ "n": n, "value": value.to_string(), "hex": script }))
        .collect();
    json!({ "txid": txid_hex(id), "vin": vin, "vout": vout, "blockHeight": height })
}

/// Same transaction as a ledger value
pub fn tx(id: u8, inputs: &[(u8, u32)], outputs: &[(Natural, &str)], height: Option<Natural>) -> Transaction {
    Transaction {
        txid: txid(id),
        inputs: inputs
            .iter()
            .map(|(prev, vout)| TransactionInput {
                prevout: OutPoint::new(txid(*prev), *vout),
                script_sig: vec![],
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(value, script)| TransactionOutput {
                value: *value,
                script_pubkey: hex::decode(script).unwrap(),
            })
            .collect(),
        height,
    }
}

#[derive(Default)]
pub struct IndexerData {
    pub best_height: u64,
    pub transactions: HashMap<String, Value>,
    pub utxos: Vec<Value>,
    pub history: Vec<Value>,
    /// Txids for which `getTransaction` answers with an error
    pub failing: HashSet<String>,
    /// Raw hex of every broadcast
    pub broadcasts: Vec<String>,
    pub broadcast_result: Option<String>,
}

/// Blockbook-like indexer answering from [`IndexerData`]
#[derive(Clone, Default)]
pub struct MockIndexer {
    pub data: Arc<Mutex<IndexerData>>,
}

impl MockIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, body: Value) {
        let id = body["txid"].as_str().unwrap().to_string();
        self.data.lock().transactions.insert(id, body);
    }

    pub fn add_utxo(&self, id: u8, vout: u32, value: Natural, height: i64) {
        self.data.lock().utxos.push(json!({
            "txid": txid_hex(id),
            "vout": vout,
            "value": value.to_string(),
            "height": height,
        }));
    }

    pub fn add_history(&self, body: Value) {
        self.data.lock().history.push(body);
    }

    pub fn connector(&self) -> MemoryConnector {
        let data = Arc::clone(&self.data);
        MemoryConnector::new(move |_, request| respond(&data, request))
    }
}

fn respond(data: &Mutex<IndexerData>, request: &WireRequest) -> Vec<Value> {
    let mut data = data.lock();
    let params = &request.params;
    let reply = match request.method.as_str() {
        METHOD_SUBSCRIBE_NEW_BLOCK => json!({ "subscribed": true }),
        METHOD_GET_INFO => json!({ "name": "Mock", "bestHeight": data.best_height }),
        METHOD_GET_ACCOUNT_UTXO => Value::Array(data.utxos.clone()),
        METHOD_GET_ACCOUNT_INFO => {
            let from = params.get("from").and_then(Value::as_i64).unwrap_or(0);
            let page = params.get("page").and_then(Value::as_u64).unwrap_or(1).max(1) as usize;
            let page_size = params.get("pageSize").and_then(Value::as_u64).unwrap_or(50) as usize;
            let matching: Vec<Value> = data
                .history
                .iter()
                .filter(|tx| {
                    let height = tx["blockHeight"].as_i64().unwrap_or(0);
                    height <= 0 || height >= from
                })
                .cloned()
                .collect();
            let total_pages = ((matching.len() + page_size - 1) / page_size).max(1);
            let transactions: Vec<Value> = matching
                .into_iter()
                .skip((page - 1) * page_size)
                .take(page_size)
                .collect();
            json!({ "page": page, "totalPages": total_pages, "transactions": transactions })
        }
        METHOD_GET_TRANSACTION => {
            let id = params["txid"].as_str().unwrap_or_default().to_string();
            match data.transactions.get(&id) {
                Some(_) if data.failing.contains(&id) => json!({ "error": { "message": "backend unavailable" } }),
                Some(body) => body.clone(),
                None => json!({ "error": { "message": "transaction not found" } }),
            }
        }
        METHOD_SEND_TRANSACTION => {
            let raw = params["hex"].as_str().unwrap_or_default().to_string();
            data.broadcasts.push(raw);
            match &data.broadcast_result {
                Some(id) => json!({ "result": id }),
                None => json!({ "error": "rejected" }),
            }
        }
        _ => return vec![],
    };
    vec![reply]
}

pub fn config() -> WalletConfig {
    WalletConfig {
        endpoints: vec![PRIMARY.to_string(), BACKUP.to_string()],
        ..WalletConfig::default()
    }
}

pub fn engine(indexer: &MockIndexer) -> (WalletEngine, MemoryConnector) {
    let connector = indexer.connector();
    let engine = WalletEngine::new(config(), Arc::new(connector.clone()), oracle()).unwrap();
    (engine, connector)
}

/// Bare client over `connector` with its own event bus
pub fn client(connector: &MemoryConnector) -> (TransportClient, broadcast::Receiver<WalletEvent>) {
    let events = EventBus::new();
    let rx = events.subscribe();
    let client = TransportClient::new(
        ClientConfig::default(),
        Arc::new(connector.clone()),
        Box::new(RoundRobinEndpoints::new(vec![PRIMARY.to_string(), BACKUP.to_string()])),
        events,
    );
    (client, rx)
}

/// Receive events until one matches
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<WalletEvent>, mut matches: F) -> WalletEvent
where
    F: FnMut(&WalletEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("event did not arrive")
}

/// Transaction source over a plain map, switchable into failure
#[derive(Default)]
pub struct MapSource {
    pub transactions: Mutex<HashMap<Hash, Transaction>>,
    pub offline: AtomicBool,
    pub fetches: Mutex<Vec<Hash>>,
}

impl MapSource {
    pub fn with(transactions: Vec<Transaction>) -> Arc<Self> {
        let source = Self::default();
        for tx in transactions {
            source.transactions.lock().insert(tx.txid, tx);
        }
        Arc::new(source)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionSource for MapSource {
    async fn fetch_transaction(&self, txid: &Hash) -> Result<Transaction> {
        self.fetches.lock().push(*txid);
        if self.offline.load(Ordering::SeqCst) {
            return Err(WalletError::CommunicationFailure("indexer offline".to_string()));
        }
        self.transactions
            .lock()
            .get(txid)
            .cloned()
            .ok_or_else(|| WalletError::MalformedPayload(format!("unknown {}", hash_to_hex(txid))))
    }
}

/// Ledger over `source` with the test oracle
pub fn ledger(source: Arc<MapSource>) -> (Ledger, broadcast::Receiver<WalletEvent>) {
    let events = EventBus::new();
    let rx = events.subscribe();
    let ledger = Ledger::new(LedgerConfig::default(), source, oracle(), events);
    (ledger, rx)
}
