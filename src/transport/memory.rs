//! In-process connector with a scripted indexer on the far side
//!
//! Each request is answered by a responder closure with zero or more reply
//! payloads. Returning nothing leaves the request unanswered. Tests keep a
//! [`MemoryLinkHandle`] to push extra frames or to drop the link.
//! A half-open endpoint never acknowledges a close, and a greeting is
//! delivered the moment a link opens.

use crate::error::Result;
use crate::transport::link::{Connector, Link, LinkEvent};
use crate::wire::{WireReply, WireRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use tokio::task::AbortHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub type Responder = Arc<dyn Fn(&str, &WireRequest) -> Vec<Value> + Send + Sync>;

#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    responder: Responder,
    unreachable: Mutex<HashSet<String>>,
    half_open: Mutex<HashSet<String>>,
    greeting: Mutex<Option<Value>>,
    links: Mutex<Vec<MemoryLinkHandle>>,
    requests: Mutex<Vec<(String, WireRequest)>>,
}

/// Server-side handle on one opened link
#[derive(Debug, Clone)]
pub struct MemoryLinkHandle {
    endpoint: String,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    server: AbortHandle,
}

impl MemoryLinkHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the server task behind this link has stopped
    pub fn is_finished(&self) -> bool {
        self.server.is_finished()
    }

    /// Push a reply frame with correlation id `id`
    pub fn push(&self, id: &str, data: Value) -> bool {
        match WireReply::new(id, data).encode() {
            Ok(text) => self.push_raw(text),
            Err(_) => false,
        }
    }

    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        self.inbound.send(LinkEvent::Message(text.into())).is_ok()
    }

    /// Drop the link without a close handshake
    pub fn drop_unclean(&self) {
        let _ = self.inbound.send(LinkEvent::Closed { clean: false });
    }

    /// Close the link from the server side with a handshake
    pub fn close_clean(&self) {
        let _ = self.inbound.send(LinkEvent::Closed { clean: true });
    }
}

impl MemoryConnector {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &WireRequest) -> Vec<Value> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(MemoryInner {
                responder: Arc::new(responder),
                unreachable: Mutex::new(HashSet::new()),
                half_open: Mutex::new(HashSet::new()),
                greeting: Mutex::new(None),
                links: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opening `endpoint` will hang until the caller gives up
    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.inner.unreachable.lock();
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Links to `endpoint` will ignore the client's close
    pub fn set_half_open(&self, endpoint: &str, half_open: bool) {
        let mut set = self.inner.half_open.lock();
        if half_open {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Reply frame with id `0` sent as soon as a link opens
    pub fn set_greeting(&self, greeting: Option<Value>) {
        *self.inner.greeting.lock() = greeting;
    }

    pub fn links(&self) -> Vec<MemoryLinkHandle> {
        self.inner.links.lock().clone()
    }

    pub fn latest_link(&self) -> Option<MemoryLinkHandle> {
        self.inner.links.lock().last().cloned()
    }

    /// Every request received so far, with the endpoint it arrived on
    pub fn requests(&self) -> Vec<(String, WireRequest)> {
        self.inner.requests.lock().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<WireRequest> {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|(_, r)| r.method == method)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &str) -> Result<Link> {
        let unreachable = self.inner.unreachable.lock().contains(endpoint);
        if unreachable {
            std::future::pending::<()>().await;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let greeting = self.inner.greeting.lock().clone();
        if let Some(data) = greeting {
            if let Ok(reply) = WireReply::new("0", data).encode() {
                let _ = inbound_tx.send(LinkEvent::Message(reply));
            }
        }
        let half_open = self.inner.half_open.lock().contains(endpoint);

        let inner = Arc::clone(&self.inner);
        let server_endpoint = endpoint.to_string();
        let server_inbound = inbound_tx.clone();
        let server = tokio::spawn(async move {
            let endpoint = server_endpoint;
            let inbound_tx = server_inbound;
            while let Some(text) = outbound_rx.recv().await {
                let request = match WireRequest::decode(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Memory server got an undecodable request");
                        continue;
                    }
                };
                trace!(endpoint = %endpoint, id = %request.id, method = %request.method, "Memory server request");
                inner.requests.lock().push((endpoint.clone(), request.clone()));

                for data in (inner.responder)(&endpoint, &request) {
                    if let Ok(reply) = WireReply::new(request.id.clone(), data).encode() {
                        let _ = inbound_tx.send(LinkEvent::Message(reply));
                    }
                }
            }
            if half_open {
                std::future::pending::<()>().await;
            }
            let _ = inbound_tx.send(LinkEvent::Closed { clean: true });
        });

        self.inner.links.lock().push(MemoryLinkHandle {
            endpoint: endpoint.to_string(),
            inbound: inbound_tx,
            server: server.abort_handle(),
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![server.abort_handle()],
        })
    }
}
