//! Watch an account on an indexer and log balance changes
//!
//! Loads the account's unspent outputs, then follows new blocks until
//! interrupted. Ownership comes from the scripts given on the command line.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use wallet_sync::logging::init_logging;
use wallet_sync::{Classification, ScriptSetOracle, WalletConfig, WalletEngine, WalletEvent};

/// CLI: `cargo run --bin wallet-watch -- --config wallet.toml --descriptor <xpub> --script <hex>`
#[derive(Parser, Debug)]
struct Opts {
    /// Path to a TOML config; defaults apply when omitted
    #[arg(long)]
    config: Option<String>,

    /// Indexer endpoint, overrides the config's list
    #[arg(long)]
    endpoint: Vec<String>,

    /// Account descriptor passed to the indexer
    #[arg(long)]
    descriptor: String,

    /// Hex scriptPubKey owned by the wallet
    #[arg(long)]
    script: Vec<String>,

    /// Hex scriptPubKey of a cold-staking output owned by the wallet
    #[arg(long)]
    cold_stake_script: Vec<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts.log);

    let mut config = match &opts.config {
        Some(path) => WalletConfig::load(path)?,
        None => WalletConfig::default(),
    };
    if !opts.endpoint.is_empty() {
        config.endpoints = opts.endpoint.clone();
    }
    if config.endpoints.is_empty() {
        bail!("no indexer endpoint given, use --endpoint or the config's `endpoints`");
    }

    let oracle = Arc::new(ScriptSetOracle::new());
    for (i, script) in opts.script.iter().enumerate() {
        let bytes = hex::decode(script).with_context(|| format!("--script {script}"))?;
        oracle.insert(bytes, Classification::basic(format!("m/0/{i}")));
    }
    for (i, script) in opts.cold_stake_script.iter().enumerate() {
        let bytes = hex::decode(script).with_context(|| format!("--cold-stake-script {script}"))?;
        oracle.insert(bytes, Classification::cold_stake(format!("m/1/{i}")));
    }

    let engine = WalletEngine::with_websocket(config, oracle)?;
    let sync = engine.sync_for(&opts.descriptor);
    let mut balances = engine.events();
    let sync_events = engine.events();

    engine.connect().await.context("connecting to indexer")?;
    if let Ok(info) = engine.client().get_info().await {
        info!(name = %info.name, best_height = info.best_height, "Indexer ready");
    }
    sync.initial_sync().await.context("initial sync")?;

    let totals = engine.ledger().totals();
    info!(spendable = totals.spendable, cold_staked = totals.cold_staked, "Balance");

    let report_balances = async {
        loop {
            match balances.recv().await {
                Ok(WalletEvent::BalanceChanged(totals)) => {
                    info!(spendable = totals.spendable, cold_staked = totals.cold_staked, "Balance");
                }
                Ok(WalletEvent::ConnectionToggled { connected: false, endpoint }) => {
                    warn!(endpoint = %endpoint, "Disconnected from indexer");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        result = sync.run(sync_events) => result?,
        _ = report_balances => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    engine.client().reset().await?;
    Ok(())
}
