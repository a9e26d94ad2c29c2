//! Error types for the transport client and the ledger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Communication failure: {0}")]
    CommunicationFailure(String),

    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    #[error("Application error: {0}")]
    ApplicationError(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Aborted: {0}")]
    Aborted(String),
}

impl WalletError {
    /// Failures of the connection itself, as opposed to bad data.
    ///
    /// Ingestion aborts on these and skips over the rest.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            WalletError::ConnectionTimeout(_)
                | WalletError::CommunicationFailure(_)
                | WalletError::NotConnected(_)
                | WalletError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for WalletError {
    fn from(e: hex::FromHexError) -> Self {
        WalletError::MalformedPayload(format!("invalid hex: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
