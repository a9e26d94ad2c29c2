//! Physical connection seam
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels standing in for one
//! streaming connection. Dropping the outbound sender asks the far side to
//! close; the inbound side always ends with exactly one [`LinkEvent::Closed`].
//! A peer that never answers the close leaves the link's `tasks` running
//! until they are aborted.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Lifecycle of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One text frame from the server
    Message(String),
    /// The connection ended; `clean` when the close handshake completed
    Closed { clean: bool },
}

pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    /// Background tasks driving the connection
    pub tasks: Vec<AbortHandle>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `endpoint`, resolving once it is usable
    async fn open(&self, endpoint: &str) -> Result<Link>;
}
