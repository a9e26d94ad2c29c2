//! JSON wire format spoken with the indexer
//!
//! Requests are `{id, method, params}`. Replies and subscription pushes are
//! `{id, data}`; an application error is reported inside the payload as
//! `data.error`, either an object with a `message` or a bare string.

use crate::error::{Result, WalletError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl WireRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReply {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl WireReply {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self { id: id.into(), data }
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The application-level error carried by this reply, if any
    pub fn application_error(&self) -> Option<String> {
        application_error(&self.data)
    }
}

/// Extract `error` from a reply payload
pub fn application_error(data: &Value) -> Option<String> {
    match data.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

/// Turn a reply payload into a typed error when it carries one
pub fn ensure_no_application_error(data: &Value) -> Result<()> {
    match application_error(data) {
        Some(message) => Err(WalletError::ApplicationError(message)),
        None => Ok(()),
    }
}
