//! Engine configuration, loadable from TOML

use crate::constants::*;
use crate::error::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing and retry knobs of the transport client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Attempts made by `send_and_wait_for_answer`
    pub max_attempts: u32,
    /// Interval between response cache polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Overall ceiling for one answer, in seconds
    pub answer_ceiling_secs: u64,
    /// Backoff after a reply carrying an application error, in milliseconds
    pub application_error_backoff_ms: u64,
    /// Polls while waiting for OPEN or CLOSED
    pub state_poll_attempts: u32,
    /// Interval between connection state polls, in milliseconds
    pub state_poll_interval_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            answer_ceiling_secs: DEFAULT_ANSWER_CEILING_SECS,
            application_error_backoff_ms: DEFAULT_APPLICATION_ERROR_BACKOFF_MS,
            state_poll_attempts: DEFAULT_STATE_POLL_ATTEMPTS,
            state_poll_interval_ms: DEFAULT_STATE_POLL_INTERVAL_MS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn answer_ceiling(&self) -> Duration {
        Duration::from_secs(self.answer_ceiling_secs)
    }

    pub fn application_error_backoff(&self) -> Duration {
        Duration::from_millis(self.application_error_backoff_ms)
    }

    /// Total bound on a connection state wait
    pub fn state_wait_bound(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms * u64::from(self.state_poll_attempts))
    }
}

/// Configuration for autonomous reconnection after an unclean close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts before giving up
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for doubling)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff delay for a 1-based attempt number
    pub fn backoff_delay(&self, attempt_number: u32) -> Duration {
        let delay = self.base_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt_number.saturating_sub(1) as i32);

        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Ledger behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Margin over a selection target reserved for fees, in percent
    pub fee_margin_percent: u64,
    /// Cache oracle classifications per script hash instead of asking on every pass
    pub cache_classifications: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fee_margin_percent: DEFAULT_FEE_MARGIN_PERCENT,
            cache_classifications: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Indexer websocket endpoints, rotated on reconnect
    pub endpoints: Vec<String>,
    pub client: ClientConfig,
    pub ledger: LedgerConfig,
    /// Transactions per `getAccountInfo` page
    pub history_page_size: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            client: ClientConfig::default(),
            ledger: LedgerConfig::default(),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }
}

impl WalletConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: WalletConfig =
            toml::from_str(s).map_err(|e| WalletError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WalletError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client.max_attempts == 0 {
            return Err(WalletError::Configuration(
                "client.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.client.poll_interval_ms == 0 || self.client.state_poll_interval_ms == 0 {
            return Err(WalletError::Configuration(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        if self.history_page_size == 0 {
            return Err(WalletError::Configuration(
                "history_page_size must be non-zero".to_string(),
            ));
        }
        if self.client.reconnect.backoff_multiplier < 1.0 {
            return Err(WalletError::Configuration(
                "reconnect.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        for endpoint in &self.endpoints {
            url::Url::parse(endpoint)
                .map_err(|e| WalletError::Configuration(format!("endpoint {endpoint}: {e}")))?;
        }
        Ok(())
    }
}
