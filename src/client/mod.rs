//! Agent side: a client that keeps one connection to the collector alive.
//!
//! [`ClientFactory::connect`] tries to connect a few times in a row. If
//! every attempt fails the client is still returned, in `Reconnecting`,
//! and a background task keeps trying with exponential backoff. When a
//! live connection drops the client goes back to `Reconnecting` and the
//! same loop takes over.
//!
//! While no connection is live:
//! - `send` drops the message and counts it ([`Client::dropped_sends`])
//! - `request` and `open_stream` fail with `NotConnected`
//!
//! # Example
//!
//! ```ignore
//! let client = ClientFactory::new(ClientConfig::default())
//!     .with_state_listener(LoggingStateListener)
//!     .connect("127.0.0.1:9994".parse()?)
//!     .await?;
//!
//! client.send(Payload::encode(KIND_SPAN, &span)?).await?;
//! ```

mod config;
mod factory;
mod listener;

pub use config::{
    ClientConfig, DEFAULT_INITIAL_RECONNECT_DELAY, DEFAULT_MAX_RECONNECT_DELAY,
    DEFAULT_SYNC_CONNECT_ATTEMPTS,
};
pub use factory::ClientFactory;
pub use listener::{LoggingStateListener, StateListener};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use self::config::ReconnectState;
use crate::connection::{wait_closed, Connection};
use crate::correlator::ResponseFuture;
use crate::error::{Result, TransportError};
use crate::protocol::Payload;
use crate::server::CommandDispatcher;
use crate::state::{ConnectionState, StateCell};
use crate::stream::{StreamContext, StreamListener};

pub(crate) struct ClientInner {
    addr: SocketAddr,
    config: ClientConfig,
    dispatcher: Option<Arc<CommandDispatcher>>,
    state: StateCell<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    connection: Mutex<Option<Connection>>,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
    dropped_sends: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    loss_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    pub(crate) fn new(
        addr: SocketAddr,
        config: ClientConfig,
        dispatcher: Option<Arc<CommandDispatcher>>,
        listeners: Vec<Arc<dyn StateListener>>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Arc::new(Self {
            addr,
            config,
            dispatcher,
            state: StateCell::new(ConnectionState::New),
            state_tx,
            connection: Mutex::new(None),
            listeners: Mutex::new(listeners),
            dropped_sends: AtomicU64::new(0),
            reconnect_task: Mutex::new(None),
            loss_watcher: Mutex::new(None),
        })
    }

    fn is_closed(&self) -> bool {
        self.state.get() == ConnectionState::Closed
    }

    /// Move to `to` and notify listeners. Refused transitions are races
    /// with `close` and are ignored.
    fn set_state(&self, to: ConnectionState) -> bool {
        let Some(from) = self.state.try_transition(to) else {
            return false;
        };
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_state_change(from, to);
        }

        self.state_tx.send_replace(to);
        true
    }

    /// One connect + handshake attempt.
    pub(crate) async fn connect_once(&self) -> Result<Connection> {
        Connection::connect(
            self.addr,
            self.config.connection.clone(),
            self.config.properties.clone(),
            self.dispatcher.clone(),
        )
        .await
    }

    /// Make `conn` the live connection and watch it for loss.
    pub(crate) fn install(self: &Arc<Self>, conn: Connection) {
        *self.connection.lock() = Some(conn.clone());
        if !self.set_state(ConnectionState::Connected) {
            self.connection.lock().take();
            conn.close();
            return;
        }

        let watcher = tokio::spawn(watch_loss(
            Arc::downgrade(self),
            conn.closed_signal(),
            conn.id(),
        ));
        if let Some(old) = self.loss_watcher.lock().replace(watcher) {
            old.abort();
        }
    }

    /// Enter `Reconnecting` and start the background loop.
    pub(crate) fn start_reconnecting(self: &Arc<Self>) {
        if !self.set_state(ConnectionState::Reconnecting) {
            return;
        }
        let task = tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        if let Some(old) = self.reconnect_task.lock().replace(task) {
            old.abort();
        }
    }

    fn on_connection_lost(self: &Arc<Self>, conn_id: u64) {
        {
            let mut slot = self.connection.lock();
            match slot.as_ref() {
                Some(conn) if conn.id() == conn_id => {
                    slot.take();
                }
                _ => return,
            }
        }
        tracing::warn!("connection {} to {} lost, reconnecting", conn_id, self.addr);
        self.start_reconnecting();
    }

    pub(crate) fn close(&self) {
        if !self.set_state(ConnectionState::Closed) {
            return;
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.loss_watcher.lock().take() {
            task.abort();
        }
        if let Some(conn) = self.connection.lock().take() {
            conn.close();
        }
        tracing::debug!("client for {} closed", self.addr);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

async fn watch_loss(client: Weak<ClientInner>, closed: watch::Receiver<bool>, conn_id: u64) {
    wait_closed(closed).await;
    if let Some(inner) = client.upgrade() {
        inner.on_connection_lost(conn_id);
    }
}

async fn reconnect_loop(client: Weak<ClientInner>) {
    let mut backoff = match client.upgrade() {
        Some(inner) => ReconnectState::new(inner.config.initial_reconnect_delay),
        None => return,
    };

    loop {
        tokio::time::sleep(backoff.current_delay).await;

        let Some(inner) = client.upgrade() else {
            return;
        };
        if inner.is_closed() {
            return;
        }

        match inner.connect_once().await {
            Ok(conn) => {
                if backoff.failure_count > 0 {
                    tracing::info!(
                        "reconnected to {} after {} failures",
                        inner.addr,
                        backoff.failure_count
                    );
                }
                inner.install(conn);
                return;
            }
            Err(TransportError::HandshakeRejected) => {
                tracing::error!("collector at {} rejected the handshake", inner.addr);
                inner.close();
                return;
            }
            Err(e) => {
                backoff.record_failure(inner.config.max_reconnect_delay);
                tracing::debug!(
                    "reconnect to {} failed ({}), next try in {:?}",
                    inner.addr,
                    e,
                    backoff.current_delay
                );
                if backoff.exhausted(inner.config.max_reconnect_attempts) {
                    tracing::error!(
                        "giving up on {} after {} attempts",
                        inner.addr,
                        backoff.failure_count
                    );
                    inner.close();
                    return;
                }
            }
        }
    }
}

/// Handle to a reconnecting connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Collector address.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Whether a live connection is installed.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .filter(|conn| conn.is_connected())
            .cloned()
    }

    /// Messages dropped because no connection was live.
    pub fn dropped_sends(&self) -> u64 {
        self.inner.dropped_sends.load(Ordering::Relaxed)
    }

    /// Register a state observer.
    pub fn add_state_listener(&self, listener: impl StateListener) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    fn live(&self) -> Result<Connection> {
        match self.connection() {
            Some(conn) => Ok(conn),
            None if self.inner.is_closed() => Err(TransportError::ConnectionClosed),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Fire-and-forget. Dropped and counted while disconnected.
    pub async fn send(&self, payload: Payload) -> Result<()> {
        match self.live() {
            Ok(conn) => conn.send(payload).await,
            Err(TransportError::NotConnected) => {
                let dropped = self.inner.dropped_sends.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "not connected, dropping message of kind {} ({} dropped)",
                    payload.kind(),
                    dropped
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send a request over the live connection.
    pub async fn request(&self, payload: Payload) -> Result<ResponseFuture> {
        self.live()?.request(payload).await
    }

    /// Open a stream over the live connection.
    pub async fn open_stream(
        &self,
        payload: Payload,
        listener: impl StreamListener,
    ) -> Result<StreamContext> {
        self.live()?.open_stream(payload, listener).await
    }

    /// Wait until the client reaches `state`.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the client closes first.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current == state {
                return Ok(());
            }
            if current == ConnectionState::Closed {
                return Err(TransportError::ConnectionClosed);
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::ConnectionClosed);
            }
        }
    }

    /// Stop reconnecting and close the live connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .field("dropped_sends", &self.dropped_sends())
            .finish()
    }
}
