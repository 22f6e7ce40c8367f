//! One live socket and everything multiplexed over it.
//!
//! A [`Connection`] owns:
//! 1. a reader task that decodes frames and fans them out in one match
//! 2. a writer task fed through a [`WriterHandle`](crate::writer::WriterHandle)
//! 3. the pending-request table ([`Correlator`])
//! 4. the stream table ([`Multiplexer`])
//! 5. an optional keep-alive task
//!
//! ```text
//!              ┌─► Response ─────────────► Correlator
//! socket ─► reader ─► Stream* ──────────────► Multiplexer
//!              ├─► Request / StreamCreate ─► CommandDispatcher (if inbound enabled)
//!              ├─► Ping ─► Pong (writer)
//!              └─► Pong ─► keep-alive
//! ```
//!
//! [`Connection::close`] happens once and is a barrier: when it returns,
//! every pending request has failed with `ConnectionClosed`, every stream
//! is closed, and the socket tasks have been released.

mod config;
pub(crate) mod keepalive;

pub use config::{
    ConnectionConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_CONCURRENT_HANDLERS, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use self::keepalive::KeepAlive;
use crate::correlator::{Correlator, ResponseFuture};
use crate::error::{Result, TransportError};
use crate::handshake::{self, Handshake, HandshakePolicy, HandshakeProperties};
use crate::protocol::{CreateFailCode, Frame, FrameBuffer, Payload};
use crate::server::CommandDispatcher;
use crate::state::{ConnectionState, StateCell};
use crate::stream::{Multiplexer, StreamContext, StreamListener, StreamOrigin};
use crate::writer::{spawn_writer_task, WriterHandle};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the socket this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connected out (the agent).
    Client,
    /// Accepted (the collector).
    Server,
}

impl Role {
    fn stream_origin(self) -> StreamOrigin {
        match self {
            Role::Client => StreamOrigin::Client,
            Role::Server => StreamOrigin::Server,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) id: u64,
    role: Role,
    peer_addr: Option<SocketAddr>,
    config: ConnectionConfig,
    state: StateCell<ConnectionState>,
    pub(crate) writer: WriterHandle,
    pub(crate) correlator: Arc<Correlator>,
    streams: Arc<Multiplexer>,
    pub(crate) keepalive: KeepAlive,
    handshake: OnceLock<Handshake>,
    handshake_slot: Mutex<Option<oneshot::Sender<Frame>>>,
    dispatcher: Option<Arc<CommandDispatcher>>,
    inbound_enabled: AtomicBool,
    handler_permits: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    settled_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl Inner {
    pub(crate) fn is_closed(&self) -> bool {
        self.state.get() == ConnectionState::Closed
    }

    /// Close once. Later calls return immediately.
    pub(crate) fn shutdown(&self, reason: Option<&TransportError>) {
        if self.state.try_transition(ConnectionState::Closed).is_none() {
            return;
        }

        match reason {
            Some(e) => tracing::warn!("connection {} closed: {}", self.id, e),
            None => tracing::debug!("connection {} closed", self.id),
        }

        let failed = self.correlator.fail_all(|| TransportError::ConnectionClosed);
        let streams = self.streams.close_all();
        self.handshake_slot.lock().take();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.writer_task.lock().take() {
            task.abort();
        }

        self.settled_tx.send_replace(true);
        self.closed_tx.send_replace(true);

        if failed > 0 || streams > 0 {
            tracing::debug!(
                "connection {}: failed {} requests, closed {} streams",
                self.id,
                failed,
                streams
            );
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown(None);
    }
}

/// A handshaken connection. Cheap to clone; clones share one socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect over TCP and run the client side of the handshake.
    ///
    /// # Errors
    ///
    /// I/O errors, `HandshakeRejected` or `HandshakeTimeout`.
    pub async fn connect(
        addr: SocketAddr,
        config: ConnectionConfig,
        properties: HandshakeProperties,
        dispatcher: Option<Arc<CommandDispatcher>>,
    ) -> Result<Connection> {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )))
            }
        };
        stream.set_nodelay(true)?;
        Self::establish(stream, Some(addr), config, properties, dispatcher).await
    }

    /// Run the client side of the handshake over an existing stream.
    pub async fn establish<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        config: ConnectionConfig,
        properties: HandshakeProperties,
        dispatcher: Option<Arc<CommandDispatcher>>,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let timeout = config.handshake_timeout;
        let (conn, reply) = Self::start(stream, Role::Client, peer_addr, config, dispatcher);

        match handshake::initiate(&conn.inner.writer, reply, properties, timeout).await {
            Ok(handshake) => {
                conn.complete_handshake(handshake)?;
                Ok(conn)
            }
            Err(e) => {
                conn.inner.shutdown(Some(&e));
                Err(e)
            }
        }
    }

    /// Run the accepting side of the handshake over an existing stream.
    pub async fn accept<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        config: ConnectionConfig,
        policy: Arc<dyn HandshakePolicy>,
        dispatcher: Option<Arc<CommandDispatcher>>,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let timeout = config.handshake_timeout;
        let (conn, request) = Self::start(stream, Role::Server, peer_addr, config, dispatcher);

        match handshake::answer(&conn.inner.writer, request, policy.as_ref(), timeout).await {
            Ok(handshake) => {
                conn.complete_handshake(handshake)?;
                Ok(conn)
            }
            Err(e) => {
                // Let a reject answer reach the peer before the socket goes.
                conn.inner.writer.wait_drained(timeout).await;
                conn.inner.shutdown(Some(&e));
                Err(e)
            }
        }
    }

    fn start<S>(
        stream: S,
        role: Role,
        peer_addr: Option<SocketAddr>,
        config: ConnectionConfig,
        dispatcher: Option<Arc<CommandDispatcher>>,
    ) -> (Connection, oneshot::Receiver<Frame>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let (settled_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        writer.limit_body(config.max_body_size);

        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            peer_addr,
            state: StateCell::new(ConnectionState::New),
            correlator: Arc::new(Correlator::new()),
            streams: Multiplexer::new(writer.clone(), role.stream_origin()),
            writer,
            keepalive: KeepAlive::new(),
            handshake: OnceLock::new(),
            handshake_slot: Mutex::new(Some(handshake_tx)),
            dispatcher,
            inbound_enabled: AtomicBool::new(false),
            handler_permits: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            tasks: Mutex::new(Vec::new()),
            writer_task: Mutex::new(Some(writer_task)),
            settled_tx,
            closed_tx,
            config,
        });

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::downgrade(&inner),
            inner.config.max_body_size,
        ));
        inner.tasks.lock().push(reader);

        tracing::debug!("connection {} started as {:?}", inner.id, role);
        (Connection { inner }, handshake_rx)
    }

    fn complete_handshake(&self, handshake: Handshake) -> Result<()> {
        let inbound = self.inner.role == Role::Server || handshake.is_duplex();
        let code = handshake.code();
        if let Some(limit) = handshake.remote_max_body_size() {
            self.inner.writer.limit_body(limit);
        }
        let _ = self.inner.handshake.set(handshake);

        if self
            .inner
            .state
            .transition(ConnectionState::Connected)
            .is_err()
        {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner.inbound_enabled.store(inbound, Ordering::Release);
        self.inner.settled_tx.send_replace(true);

        if self.inner.config.keepalive_enabled() {
            let monitor = tokio::spawn(keepalive::monitor(
                Arc::downgrade(&self.inner),
                self.inner.config.ping_interval,
                self.inner.config.ping_timeout,
            ));
            self.inner.tasks.lock().push(monitor);
        }

        tracing::info!(
            "connection {} established with {:?} ({:?})",
            self.inner.id,
            self.inner.peer_addr,
            code
        );
        Ok(())
    }

    /// Process-unique connection number.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Which end of the socket this is.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Whether the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Negotiated handshake.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.inner.handshake.get()
    }

    /// Properties the peer sent in the handshake.
    pub fn remote_properties(&self) -> Option<&HandshakeProperties> {
        self.handshake().map(Handshake::remote)
    }

    /// Settings this connection runs with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Live stream channels.
    pub fn open_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Look up a live stream.
    pub fn stream(&self, stream_id: u32) -> Option<StreamContext> {
        self.inner.streams.get(stream_id)
    }

    /// Round-trip time of the last keep-alive ping.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.inner.keepalive.last_rtt()
    }

    /// Frames queued but not yet written.
    pub fn writer_backlog(&self) -> usize {
        self.inner.writer.pending_count()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(TransportError::ConnectionClosed),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn write(&self, frame: &Frame) -> Result<()> {
        let result = self.inner.writer.send(frame).await;
        if let Err(TransportError::ConnectionClosed) = &result {
            self.inner.shutdown(Some(&TransportError::ConnectionClosed));
        }
        result
    }

    /// Fire-and-forget. Returns once the frame is queued.
    pub async fn send(&self, payload: Payload) -> Result<()> {
        self.ensure_open()?;
        self.write(&Frame::Send(payload)).await
    }

    /// Send a request and return a handle to its response.
    ///
    /// The handle carries the configured request deadline; override it
    /// with [`ResponseFuture::with_timeout`].
    pub async fn request(&self, payload: Payload) -> Result<ResponseFuture> {
        self.ensure_open()?;
        let response = self
            .inner
            .correlator
            .issue(self.inner.config.request_timeout)?;
        self.write(&Frame::Request {
            request_id: response.id(),
            payload,
        })
        .await?;
        Ok(response)
    }

    /// Answer a request the peer sent.
    pub async fn respond(&self, request_id: u32, payload: Payload) -> Result<()> {
        self.ensure_open()?;
        self.write(&Frame::Response {
            request_id,
            payload,
        })
        .await
    }

    /// Open a stream; events arrive at `listener`.
    pub async fn open_stream(
        &self,
        payload: Payload,
        listener: impl StreamListener,
    ) -> Result<StreamContext> {
        self.ensure_open()?;
        self.inner.streams.open(payload, Arc::new(listener)).await
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown(None);
    }

    /// Resolve once the connection is closed.
    pub async fn closed(&self) {
        wait_closed(self.closed_signal()).await;
    }

    /// Close notification that does not keep the connection alive.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    fn dispatch_frame(&self, frame: Frame) {
        match frame {
            Frame::Send(payload) => self.dispatch_message(payload),
            Frame::Request {
                request_id,
                payload,
            } => self.dispatch_request(request_id, payload),
            Frame::Response {
                request_id,
                payload,
            } => {
                self.inner.correlator.resolve(request_id, payload);
            }
            Frame::StreamCreate { stream_id, payload } => self.dispatch_stream(stream_id, payload),
            Frame::StreamCreateAck { stream_id } => self.inner.streams.on_ack(stream_id),
            Frame::StreamCreateFail { stream_id, code } => {
                self.inner.streams.on_fail(stream_id, code)
            }
            Frame::StreamData { stream_id, payload } => {
                self.inner.streams.on_data(stream_id, payload)
            }
            Frame::StreamClose { stream_id, code } => self.inner.streams.on_close(stream_id, code),
            frame @ (Frame::HandshakeRequest { .. } | Frame::HandshakeResponse { .. }) => {
                let waiter = self.inner.handshake_slot.lock().take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::warn!(
                        "{}",
                        TransportError::ProtocolAnomaly(format!(
                            "{:?} after handshake on connection {}",
                            frame.frame_type(),
                            self.inner.id
                        ))
                    ),
                }
            }
            Frame::Ping { ping_id } => self.inner.writer.send_nowait(Frame::Pong { ping_id }),
            Frame::Pong { ping_id } => self.inner.keepalive.on_pong(ping_id),
        }
    }

    fn inbound_enabled(&self) -> bool {
        self.inner.inbound_enabled.load(Ordering::Acquire)
    }

    fn refuse_request(&self, request_id: u32, reason: &str) {
        tracing::debug!(
            "connection {}: refusing request {}: {}",
            self.inner.id,
            request_id,
            reason
        );
        self.inner.writer.send_nowait(Frame::Response {
            request_id,
            payload: Payload::unsupported(reason),
        });
    }

    fn dispatch_message(&self, payload: Payload) {
        let Some(dispatcher) = &self.inner.dispatcher else {
            tracing::debug!("dropping message of kind {}: no dispatcher", payload.kind());
            return;
        };
        let Ok(permit) = self.inner.handler_permits.clone().try_acquire_owned() else {
            tracing::warn!(
                "handler capacity reached, dropping message of kind {}",
                payload.kind()
            );
            return;
        };
        dispatcher.dispatch_message(self.clone(), payload, permit);
    }

    fn dispatch_request(&self, request_id: u32, payload: Payload) {
        if !self.inbound_enabled() {
            self.refuse_request(request_id, "inbound requests are not accepted on this link");
            return;
        }
        let Some(dispatcher) = &self.inner.dispatcher else {
            self.refuse_request(request_id, &format!("no handler for kind {}", payload.kind()));
            return;
        };
        let Ok(permit) = self.inner.handler_permits.clone().try_acquire_owned() else {
            self.refuse_request(request_id, "handler capacity reached");
            return;
        };
        dispatcher.dispatch_request(self.clone(), request_id, payload, permit);
    }

    fn dispatch_stream(&self, stream_id: u32, payload: Payload) {
        let Some(stream) = self.inner.streams.on_create(stream_id) else {
            return;
        };
        if !self.inbound_enabled() {
            tracing::debug!("refusing stream {}: inbound disabled", stream_id);
            stream.reject(CreateFailCode::ChannelUnsupported);
            return;
        }
        match &self.inner.dispatcher {
            Some(dispatcher) => dispatcher.dispatch_stream(stream, payload),
            None => stream.reject(CreateFailCode::TypeUnknown),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) async fn wait_closed(mut signal: watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Main read loop - reads frames and dispatches them.
async fn read_loop<R>(mut reader: R, conn: Weak<Inner>, max_body_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_body(max_body_size);
    let mut buf = vec![0u8; 64 * 1024]; // 64KB read buffer

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None, // Peer closed
            Ok(n) => n,
            Err(e) => break Some(TransportError::Io(e)),
        };

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => break Some(e),
        };

        for frame in frames {
            let Some(inner) = conn.upgrade() else {
                return;
            };
            let connection = Connection { inner };
            let handshake = matches!(
                frame,
                Frame::HandshakeRequest { .. } | Frame::HandshakeResponse { .. }
            );
            connection.dispatch_frame(frame);

            // Frames behind the handshake wait for the negotiated mode.
            if handshake {
                let mut settled = connection.inner.settled_tx.subscribe();
                drop(connection);
                let _ = settled.wait_for(|done| *done).await;
            }
        }
    };

    if let Some(inner) = conn.upgrade() {
        if let Some(e) = &reason {
            if e.is_fatal() && !inner.is_closed() {
                tracing::error!("connection {} read error: {}", inner.id, e);
            }
        }
        inner.shutdown(reason.as_ref());
    }
}
