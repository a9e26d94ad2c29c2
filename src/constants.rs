//! Protocol and engine constants

/// Smallest currency units per whole coin
pub const UNITS_PER_COIN: u64 = 100_000_000;

/// Decimal places carried by coin-denominated amounts
pub const COIN_DECIMALS: usize = 8;

/// Attempts made by `send_and_wait_for_answer` before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Interval between response cache polls: 100ms
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Overall ceiling for waiting on one answer: 600s
pub const DEFAULT_ANSWER_CEILING_SECS: u64 = 600;

/// Backoff after a reply carrying an application error: 1s
pub const DEFAULT_APPLICATION_ERROR_BACKOFF_MS: u64 = 1_000;

/// Polls while waiting for a connection to reach OPEN or CLOSED
pub const DEFAULT_STATE_POLL_ATTEMPTS: u32 = 100;

/// Interval between connection state polls (100 x 100ms = 10s)
pub const DEFAULT_STATE_POLL_INTERVAL_MS: u64 = 100;

/// Margin on top of a selection target reserved for fees, in percent
pub const DEFAULT_FEE_MARGIN_PERCENT: u64 = 10;

/// Transactions per page requested from `getAccountInfo`
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;

/// Capacity of the wallet event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Wire method names consumed by the engine
pub const METHOD_SUBSCRIBE_NEW_BLOCK: &str = "subscribeNewBlock";
pub const METHOD_GET_ACCOUNT_INFO: &str = "getAccountInfo";
pub const METHOD_GET_ACCOUNT_UTXO: &str = "getAccountUtxo";
pub const METHOD_GET_TRANSACTION: &str = "getTransaction";
pub const METHOD_SEND_TRANSACTION: &str = "sendTransaction";
pub const METHOD_GET_INFO: &str = "getInfo";
