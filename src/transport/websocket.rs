//! Websocket connector built on tungstenite

use crate::error::{Result, WalletError};
use crate::transport::link::{Connector, Link, LinkEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Opens `ws://` and `wss://` endpoints
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &str) -> Result<Link> {
        let url = Url::parse(endpoint)
            .map_err(|e| WalletError::Transport(format!("invalid endpoint {endpoint}: {e}")))?;
        let (ws_stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| WalletError::Transport(format!("websocket connect to {endpoint} failed: {e}")))?;
        debug!(endpoint, status = %response.status(), "Websocket handshake complete");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_endpoint = endpoint.to_string();
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(endpoint = %writer_endpoint, error = %e, "Websocket send failed");
                    return;
                }
            }
            // Sender dropped: start the close handshake
            if let Err(e) = sink.close().await {
                debug!(endpoint = %writer_endpoint, error = %e, "Websocket close failed");
            }
        });

        let reader_endpoint = endpoint.to_string();
        let reader = tokio::spawn(async move {
            let clean = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(LinkEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = inbound_tx.send(LinkEvent::Message(text));
                        }
                        Err(e) => warn!(endpoint = %reader_endpoint, error = %e, "Dropping non-UTF-8 frame"),
                    },
                    Some(Ok(Message::Close(_))) => break true,
                    // Pings are answered by tungstenite itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(endpoint = %reader_endpoint, error = %e, "Websocket receive failed");
                        break false;
                    }
                    None => break false,
                }
            };
            let _ = inbound_tx.send(LinkEvent::Closed { clean });
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer.abort_handle(), reader.abort_handle()],
        })
    }
}
