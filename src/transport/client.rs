//! Correlated request/response client over a replaceable streaming connection
//!
//! Every outgoing call gets a fresh correlation id. Replies are cached under
//! their id until a one-shot consumer takes them; subscription pushes are
//! also handed to the registered callback.
//!
//! Each connection instance is tagged with a generation number. Anything
//! that started against one generation (a waiter, a reader task, a
//! scheduled reconnect) checks it before acting, so a swapped connection
//! can never feed or block work started on the old one.

use crate::config::ClientConfig;
use crate::constants::METHOD_SUBSCRIBE_NEW_BLOCK;
use crate::error::{Result, WalletError};
use crate::events::{EventBus, WalletEvent};
use crate::transport::endpoints::EndpointRotation;
use crate::transport::link::{ConnectionState, Connector, LinkEvent};
use crate::wire::{application_error, WireReply, WireRequest};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Callback invoked for every push delivered to a subscription
pub type SubscriptionCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies the connection instance a request was sent on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    generation: u64,
}

impl ConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Session {
    generation: u64,
    endpoint: String,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    link_tasks: Vec<AbortHandle>,
}

struct StandingSubscription {
    method: String,
    params: Value,
    callback: SubscriptionCallback,
}

enum Answer {
    Data(Value),
    Superseded,
    TimedOut,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    rotation: Mutex<Box<dyn EndpointRotation>>,
    events: EventBus,
    next_id: AtomicU64,
    /// Bumped on every open attempt and every teardown
    generation: AtomicU64,
    /// Bumped on caller-initiated connect/reset; cancels pending opens and
    /// reconnects
    epoch: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    responses: Mutex<HashMap<String, Value>>,
    subscriptions: Mutex<HashMap<String, SubscriptionCallback>>,
    standing: Mutex<Vec<StandingSubscription>>,
    lifecycle: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct TransportClient {
    shared: Arc<Shared>,
}

impl TransportClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        rotation: Box<dyn EndpointRotation>,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (epoch, _) = watch::channel(0);

        let new_block_events = events.clone();
        let new_block = StandingSubscription {
            method: METHOD_SUBSCRIBE_NEW_BLOCK.to_string(),
            params: json!({}),
            callback: Arc::new(move |data: &Value| {
                // The first push is only the subscription acknowledgement
                if let Some(height) = data.get("height").and_then(Value::as_u64) {
                    let hash = data
                        .get("hash")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    new_block_events.emit(WalletEvent::NewBlock { height, hash });
                }
            }),
        };

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                rotation: Mutex::new(rotation),
                events,
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                epoch,
                state,
                session: Mutex::new(None),
                responses: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                standing: Mutex::new(vec![new_block]),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Replace any current connection with a new one to `endpoint`.
    ///
    /// The old connection is closed and drained first. Fails with
    /// `ConnectionTimeout` when the new connection does not open within
    /// `state_poll_attempts * state_poll_interval`, and with `Aborted` when a
    /// later `connect` or `reset` arrives while it is still opening.
    pub async fn connect(&self, endpoint: &str) -> Result<ConnectionHandle> {
        self.shared.connect(endpoint, None).await
    }

    /// Close the current connection and forget cached replies and subscriptions
    pub async fn reset(&self) -> Result<()> {
        // Bumped before locking so an open in flight gives up the lock
        self.shared.bump_epoch();
        let _guard = self.shared.lifecycle.lock().await;
        self.shared.teardown().await
    }

    /// Transmit one request on the open connection
    pub fn send(&self, method: &str, params: Value) -> Result<(String, ConnectionHandle)> {
        self.shared.send(method, params)
    }

    /// Send `method` and wait for its reply, retrying on application errors
    /// and on connection swaps.
    pub async fn send_and_wait_for_answer(&self, method: &str, params: Value) -> Result<Value> {
        let config = &self.shared.config;
        let deadline = Instant::now() + config.answer_ceiling();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=config.max_attempts {
            if Instant::now() >= deadline {
                break;
            }

            let (id, handle) = match self.send(method, params.clone()) {
                Ok(sent) => sent,
                Err(e) => {
                    warn!(method, attempt, error = %e, "Request could not be sent, will retry");
                    last_error = e.to_string();
                    sleep_until(deadline.min(Instant::now() + config.application_error_backoff()))
                        .await;
                    continue;
                }
            };

            match self.wait_for_answer(&id, handle, deadline).await {
                Answer::Data(data) => match application_error(&data) {
                    None => return Ok(data),
                    Some(message) => {
                        warn!(method, id = %id, attempt, error = %message, "Indexer returned an error");
                        last_error = WalletError::ApplicationError(message).to_string();
                        sleep_until(
                            deadline.min(Instant::now() + config.application_error_backoff()),
                        )
                        .await;
                    }
                },
                Answer::Superseded => {
                    debug!(method, id = %id, attempt, "Connection replaced while waiting, retrying");
                    last_error = "connection replaced while waiting".to_string();
                }
                Answer::TimedOut => {
                    last_error = format!("no answer within {:?}", config.answer_ceiling());
                    break;
                }
            }
        }

        error!(method, error = %last_error, "Request failed");
        Err(WalletError::CommunicationFailure(format!(
            "{method}: {last_error}"
        )))
    }

    /// Register `callback` for every push answering a fresh subscription.
    ///
    /// The subscription is re-issued after every reconnect.
    pub fn subscribe<F>(&self, method: &str, params: Value, callback: F) -> Result<String>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: SubscriptionCallback = Arc::new(callback);
        let id = self
            .shared
            .register_subscription(method, params.clone(), Arc::clone(&callback))?;
        self.shared.standing.lock().push(StandingSubscription {
            method: method.to_string(),
            params,
            callback,
        });
        Ok(id)
    }

    /// Remove and return the cached reply for `id`
    pub fn take_response(&self, id: &str) -> Option<Value> {
        self.shared.responses.lock().remove(id)
    }

    pub fn cached_responses(&self) -> usize {
        self.shared.responses.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Endpoint of the open connection
    pub fn endpoint(&self) -> Option<String> {
        self.shared.session.lock().as_ref().map(|s| s.endpoint.clone())
    }

    /// Handle of the open connection
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        let session = self.shared.session.lock();
        session
            .as_ref()
            .filter(|_| self.state() == ConnectionState::Open)
            .map(|s| ConnectionHandle { generation: s.generation })
    }

    /// True while `handle` still names the open connection
    pub fn is_current(&self, handle: ConnectionHandle) -> bool {
        self.shared.is_current(handle.generation)
    }

    async fn wait_for_answer(&self, id: &str, handle: ConnectionHandle, deadline: Instant) -> Answer {
        let poll_interval = self.shared.config.poll_interval();
        loop {
            if let Some(data) = self.take_response(id) {
                return Answer::Data(data);
            }
            if !self.is_current(handle) {
                return Answer::Superseded;
            }
            let now = Instant::now();
            if now >= deadline {
                return Answer::TimedOut;
            }
            sleep_until(deadline.min(now + poll_interval)).await;
        }
    }
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && *self.state.borrow() == ConnectionState::Open
    }

    fn bump_epoch(&self) -> u64 {
        let mut bumped = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            bumped = *epoch;
        });
        bumped
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    async fn connect(self: &Arc<Self>, endpoint: &str, expected_epoch: Option<u64>) -> Result<ConnectionHandle> {
        let epoch = match expected_epoch {
            Some(epoch) => epoch,
            None => self.bump_epoch(),
        };
        let epochs = self.epoch.subscribe();

        let _guard = self.lifecycle.lock().await;
        if self.current_epoch() != epoch {
            return Err(WalletError::Aborted(format!(
                "connect to {endpoint} superseded by a newer connect or reset"
            )));
        }

        self.teardown().await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connecting);
        info!(endpoint, generation, "Connecting to indexer");

        let bound = self.config.state_wait_bound();
        let opened = tokio::select! {
            opened = timeout(bound, self.connector.open(endpoint)) => opened,
            _ = superseded(epochs, epoch) => {
                self.state.send_replace(ConnectionState::Closed);
                info!(endpoint, generation, "Open abandoned for a newer connect or reset");
                return Err(WalletError::Aborted(format!(
                    "connect to {endpoint} superseded by a newer connect or reset"
                )));
            }
        };
        let link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Closed);
                warn!(endpoint, error = %e, "Connection failed");
                return Err(e);
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Closed);
                warn!(endpoint, ?bound, "Connection did not open in time");
                return Err(WalletError::ConnectionTimeout(format!(
                    "{endpoint} did not open within {bound:?}"
                )));
            }
        };

        {
            // OPEN before the reader starts so no early frame is judged stale;
            // the session lock keeps senders and an immediate drop waiting
            // until the session is registered
            let mut session = self.session.lock();
            self.state.send_replace(ConnectionState::Open);
            let reader = spawn_reader(Arc::clone(self), generation, endpoint.to_string(), link.inbound);
            *session = Some(Session {
                generation,
                endpoint: endpoint.to_string(),
                outbound: link.outbound,
                reader,
                link_tasks: link.tasks,
            });
        }
        info!(endpoint, generation, "Connection open");
        self.events.emit(WalletEvent::ConnectionToggled {
            connected: true,
            endpoint: endpoint.to_string(),
        });

        let standing: Vec<(String, Value, SubscriptionCallback)> = self
            .standing
            .lock()
            .iter()
            .map(|s| (s.method.clone(), s.params.clone(), Arc::clone(&s.callback)))
            .collect();
        for (method, params, callback) in standing {
            self.register_subscription(&method, params, callback)?;
        }

        Ok(ConnectionHandle { generation })
    }

    /// Close the current connection, wait for CLOSED, then drop cached state.
    /// Callers hold the lifecycle lock.
    async fn teardown(&self) -> Result<()> {
        let session = self.session.lock().take();
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut outcome = Ok(());
        if let Some(Session { endpoint, outbound, mut reader, link_tasks, .. }) = session {
            self.state.send_replace(ConnectionState::Closing);
            debug!(endpoint = %endpoint, "Closing connection");
            drop(outbound);

            let bound = self.config.state_wait_bound();
            if timeout(bound, &mut reader).await.is_err() {
                reader.abort();
                for task in &link_tasks {
                    task.abort();
                }
                warn!(endpoint = %endpoint, ?bound, "Connection did not close in time");
                outcome = Err(WalletError::ConnectionTimeout(format!(
                    "{endpoint} did not close within {bound:?}"
                )));
            }
            self.events.emit(WalletEvent::ConnectionToggled {
                connected: false,
                endpoint,
            });
        }

        self.state.send_replace(ConnectionState::Closed);
        self.responses.lock().clear();
        self.subscriptions.lock().clear();
        outcome
    }

    fn send(&self, method: &str, params: Value) -> Result<(String, ConnectionHandle)> {
        let session = self.session.lock();
        let session = session
            .as_ref()
            .filter(|_| *self.state.borrow() == ConnectionState::Open)
            .ok_or_else(|| WalletError::NotConnected(format!("cannot send {method}")))?;

        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let text = WireRequest::new(id.clone(), method, params).encode()?;
        session
            .outbound
            .send(text)
            .map_err(|_| WalletError::NotConnected(format!("link closed while sending {method}")))?;

        debug!(id = %id, method, generation = session.generation, "Request sent");
        Ok((id, ConnectionHandle { generation: session.generation }))
    }

    fn register_subscription(&self, method: &str, params: Value, callback: SubscriptionCallback) -> Result<String> {
        if *self.state.borrow() != ConnectionState::Open {
            return Err(WalletError::NotConnected(format!("cannot subscribe to {method}")));
        }
        // Reserve the id first so the acknowledgement cannot race the table
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.subscriptions.lock().insert(id.clone(), callback);

        let sent = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(session) => WireRequest::new(id.clone(), method, params)
                    .encode()
                    .and_then(|text| {
                        session.outbound.send(text).map_err(|_| {
                            WalletError::NotConnected(format!("link closed while subscribing to {method}"))
                        })
                    }),
                None => Err(WalletError::NotConnected(format!("cannot subscribe to {method}"))),
            }
        };
        if let Err(e) = sent {
            self.subscriptions.lock().remove(&id);
            return Err(e);
        }

        debug!(id = %id, method, "Subscription registered");
        Ok(id)
    }

    fn handle_message(&self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            debug!(generation, "Dropping message from a superseded connection");
            return;
        }
        let reply = match WireReply::decode(text) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable message");
                return;
            }
        };

        let callback = self.subscriptions.lock().get(&reply.id).cloned();
        if let Some(callback) = callback {
            callback(&reply.data);
        }
        self.responses.lock().insert(reply.id, reply.data);
    }

    /// The connection dropped without us asking
    fn connection_lost(self: &Arc<Self>, generation: u64, endpoint: String, clean: bool) {
        {
            let mut session = self.session.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if session.as_ref().map(|s| s.generation) == Some(generation) {
                session.take();
            }
            self.state.send_replace(ConnectionState::Closed);
        }

        self.events.emit(WalletEvent::ConnectionToggled {
            connected: false,
            endpoint: endpoint.clone(),
        });

        if clean {
            info!(endpoint = %endpoint, "Connection closed by server");
        } else {
            warn!(endpoint = %endpoint, generation, "Connection dropped, scheduling reconnect");
            spawn_reconnect(Arc::clone(self), self.current_epoch(), endpoint);
        }
    }

    async fn reconnect(self: Arc<Self>, epoch: u64, lost_endpoint: String) {
        let policy = self.config.reconnect.clone();
        let mut endpoint = lost_endpoint;

        for attempt in 1..=policy.max_attempts {
            sleep(policy.backoff_delay(attempt)).await;
            if self.current_epoch() != epoch {
                debug!("Reconnect cancelled by a newer connect or reset");
                return;
            }

            let next = self.rotation.lock().next_endpoint(&endpoint);
            endpoint = next.unwrap_or(endpoint);

            match self.connect(&endpoint, Some(epoch)).await {
                Ok(handle) => {
                    info!(endpoint = %endpoint, attempt, generation = handle.generation, "Reconnected");
                    return;
                }
                Err(WalletError::Aborted(_)) => return,
                Err(e) => {
                    warn!(endpoint = %endpoint, attempt, max_attempts = policy.max_attempts, error = %e, "Reconnect attempt failed");
                }
            }
        }

        error!(endpoint = %endpoint, "Reconnection exhausted all attempts");
    }
}

fn spawn_reader(
    shared: Arc<Shared>,
    generation: u64,
    endpoint: String,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) -> JoinHandle<()> {
    // One task per connection: pushes are delivered in arrival order and
    // never concurrently
    tokio::spawn(async move {
        let mut clean = false;
        while let Some(event) = inbound.recv().await {
            match event {
                LinkEvent::Message(text) => shared.handle_message(generation, &text),
                LinkEvent::Closed { clean: was_clean } => {
                    clean = was_clean;
                    break;
                }
            }
        }
        shared.connection_lost(generation, endpoint, clean);
    })
}

/// Resolves once the epoch moves past `epoch`
async fn superseded(mut epochs: watch::Receiver<u64>, epoch: u64) {
    loop {
        if *epochs.borrow_and_update() != epoch {
            return;
        }
        if epochs.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_reconnect(shared: Arc<Shared>, epoch: u64, endpoint: String) {
    let task: BoxFuture<'static, ()> = Box::pin(shared.reconnect(epoch, endpoint));
    tokio::spawn(task);
}
