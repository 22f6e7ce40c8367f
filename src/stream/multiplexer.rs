//! Stream table of one connection and the inbound stream-frame rules.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::{StreamChannel, StreamContext};
use super::{StreamEvent, StreamListener, StreamOrigin, StreamState};
use crate::error::{Result, TransportError};
use crate::protocol::{CloseCode, CreateFailCode, Frame, Payload};
use crate::writer::WriterHandle;

struct Table {
    channels: HashMap<u32, Arc<StreamChannel>>,
    next_id: u32,
    closed: bool,
}

/// Routes stream frames of one connection to their channels.
pub struct Multiplexer {
    writer: WriterHandle,
    local: StreamOrigin,
    table: Mutex<Table>,
}

impl Multiplexer {
    /// Create a table that opens streams in `local`'s ID namespace.
    pub fn new(writer: WriterHandle, local: StreamOrigin) -> Arc<Self> {
        Arc::new(Self {
            writer,
            local,
            table: Mutex::new(Table {
                channels: HashMap::new(),
                next_id: local.first_id(),
                closed: false,
            }),
        })
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.table.lock().channels.len()
    }

    /// Whether no channel is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live channel.
    pub fn get(self: &Arc<Self>, stream_id: u32) -> Option<StreamContext> {
        let channel = self.table.lock().channels.get(&stream_id).cloned()?;
        Some(StreamContext::new(channel, self.clone()))
    }

    /// Open a stream: send `StreamCreate` and wait in `ConnectAwait`.
    ///
    /// Returns as soon as the create is queued; use
    /// [`StreamContext::wait_connected`] or the listener's
    /// [`StreamEvent::Connected`] to learn the outcome.
    pub async fn open(
        self: &Arc<Self>,
        payload: Payload,
        listener: Arc<dyn StreamListener>,
    ) -> Result<StreamContext> {
        let channel = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(TransportError::ConnectionClosed);
            }
            let id = Self::allocate_id(&mut table, self.local);
            let channel = Arc::new(StreamChannel::new(id));
            channel.set_listener(listener);
            if let Err(e) = channel
                .transition(StreamState::Open)
                .and_then(|_| channel.transition(StreamState::ConnectAwait))
            {
                return Err(TransportError::IllegalState(e.to_string()));
            }
            table.channels.insert(id, channel.clone());
            channel
        };

        let ctx = StreamContext::new(channel, self.clone());
        tracing::debug!("opening stream {}", ctx.id());

        let sent = self
            .writer
            .send(&Frame::StreamCreate {
                stream_id: ctx.id(),
                payload,
            })
            .await;
        if let Err(e) = sent {
            ctx.channel().try_transition(StreamState::Closed);
            self.remove(ctx.id());
            return Err(e);
        }
        Ok(ctx)
    }

    fn allocate_id(table: &mut Table, local: StreamOrigin) -> u32 {
        let mut id = table.next_id;
        while table.channels.contains_key(&id) {
            id = Self::step(id, local);
        }
        table.next_id = Self::step(id, local);
        id
    }

    fn step(id: u32, local: StreamOrigin) -> u32 {
        id.checked_add(2).unwrap_or(local.first_id())
    }

    /// Register a stream the peer is opening.
    ///
    /// Returns the new channel in `ConnectArrived`, or `None` when the
    /// create was invalid and has already been answered.
    pub fn on_create(self: &Arc<Self>, stream_id: u32) -> Option<StreamContext> {
        if StreamOrigin::of(stream_id) == self.local || stream_id == 0 {
            tracing::warn!(
                "{}",
                TransportError::ProtocolAnomaly(format!(
                    "peer opened stream {} in the local id space",
                    stream_id
                ))
            );
            self.writer.send_nowait(Frame::StreamClose {
                stream_id,
                code: CloseCode::StateError,
            });
            return None;
        }

        let channel = {
            let mut table = self.table.lock();
            if table.closed {
                drop(table);
                self.writer.send_nowait(Frame::StreamCreateFail {
                    stream_id,
                    code: CreateFailCode::ConnectionClosed,
                });
                return None;
            }
            if let Some(existing) = table.channels.get(&stream_id).cloned() {
                Err(existing)
            } else {
                let channel = Arc::new(StreamChannel::new(stream_id));
                // New -> Open -> ConnectArrived cannot fail on a fresh cell.
                let _ = channel.transition(StreamState::Open);
                let _ = channel.transition(StreamState::ConnectArrived);
                table.channels.insert(stream_id, channel.clone());
                Ok(channel)
            }
        };

        match channel {
            Ok(channel) => {
                tracing::debug!("peer opened stream {}", stream_id);
                Some(StreamContext::new(channel, self.clone()))
            }
            Err(existing) => {
                let ctx = StreamContext::new(existing, self.clone());
                let _ = ctx.channel().transition(StreamState::ConnectArrived);
                self.tear_down(&ctx);
                None
            }
        }
    }

    /// Handle the peer's `StreamCreateAck`.
    pub fn on_ack(self: &Arc<Self>, stream_id: u32) {
        let Some(ctx) = self.lookup(stream_id, "ack") else {
            return;
        };
        if ctx.origin() != self.local {
            self.illegal(&ctx);
            return;
        }
        match ctx.channel().transition(StreamState::Connected) {
            Ok(_) => {
                tracing::debug!("stream {} connected", stream_id);
                ctx.emit(StreamEvent::Connected);
            }
            Err(e) => {
                tracing::warn!("stream {}: {}", stream_id, e);
                self.tear_down(&ctx);
            }
        }
    }

    /// Handle the peer's `StreamCreateFail`. Records the code; never raises.
    pub fn on_fail(self: &Arc<Self>, stream_id: u32, code: CreateFailCode) {
        let Some(ctx) = self.lookup(stream_id, "create-fail") else {
            return;
        };
        if ctx.origin() != self.local || ctx.state() != StreamState::ConnectAwait {
            self.illegal(&ctx);
            return;
        }
        ctx.channel().record_fail(code);
        if ctx.channel().try_transition(StreamState::Closed).is_some() {
            self.remove(stream_id);
            tracing::debug!("stream {} rejected: {:?}", stream_id, code);
            ctx.emit(StreamEvent::Rejected(code));
        }
    }

    /// Handle inbound `StreamData`; delivered to the listener in order.
    pub fn on_data(self: &Arc<Self>, stream_id: u32, payload: Payload) {
        let Some(ctx) = self.lookup(stream_id, "data") else {
            return;
        };
        if !ctx.state().accepts_data() {
            self.illegal(&ctx);
            return;
        }
        ctx.emit(StreamEvent::Data(payload));
    }

    /// Handle the peer's `StreamClose`.
    ///
    /// Closing an unknown or already-closed stream is tolerated.
    pub fn on_close(self: &Arc<Self>, stream_id: u32, code: CloseCode) {
        let Some(ctx) = self.lookup(stream_id, "close") else {
            return;
        };
        if ctx.channel().try_transition(StreamState::Closed).is_none() {
            tracing::debug!(
                "stream {} close ignored in state {:?}",
                stream_id,
                ctx.state()
            );
            return;
        }
        ctx.channel().record_close(code);
        self.remove(stream_id);
        tracing::debug!("stream {} closed by peer: {:?}", stream_id, code);
        ctx.emit(StreamEvent::Closed(code));
    }

    /// Close every channel and refuse new ones. Sends nothing.
    pub fn close_all(self: &Arc<Self>) -> usize {
        let drained: Vec<Arc<StreamChannel>> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.channels.drain().map(|(_, c)| c).collect()
        };

        let count = drained.len();
        for channel in drained {
            let ctx = StreamContext::new(channel, self.clone());
            if ctx.state() == StreamState::ConnectAwait {
                ctx.channel().record_fail(CreateFailCode::ConnectionClosed);
            }
            ctx.channel().record_close(CloseCode::ConnectionClosed);
            if ctx.channel().try_transition(StreamState::Closed).is_some() {
                ctx.emit(StreamEvent::Closed(CloseCode::ConnectionClosed));
            }
        }
        count
    }

    pub(crate) fn remove(&self, stream_id: u32) {
        self.table.lock().channels.remove(&stream_id);
    }

    fn lookup(self: &Arc<Self>, stream_id: u32, what: &str) -> Option<StreamContext> {
        let ctx = self.get(stream_id);
        if ctx.is_none() {
            tracing::debug!("{} for unknown stream {}", what, stream_id);
        }
        ctx
    }

    fn illegal(&self, ctx: &StreamContext) {
        let _ = ctx.channel().transition(StreamState::IllegalState);
        self.tear_down(ctx);
    }

    /// Drop a channel that broke the state table and tell the peer.
    fn tear_down(&self, ctx: &StreamContext) {
        tracing::warn!(
            "stream {} violated its state table ({:?}); closing",
            ctx.id(),
            ctx.state()
        );
        ctx.channel().record_close(CloseCode::StateError);
        self.remove(ctx.id());
        self.writer.send_nowait(Frame::StreamClose {
            stream_id: ctx.id(),
            code: CloseCode::StateError,
        });
        ctx.emit(StreamEvent::Closed(CloseCode::StateError));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use crate::stream::{channel, NoopListener};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Peer {
        stream: DuplexStream,
        buffer: FrameBuffer,
        queued: VecDeque<Frame>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.queued.pop_front() {
                    return frame;
                }
                let mut chunk = [0u8; 256];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer closed");
                self.queued.extend(self.buffer.push(&chunk[..n]).unwrap());
            }
        }
    }

    fn setup(local: StreamOrigin) -> (Arc<Multiplexer>, Peer) {
        let (ours, theirs) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(ours, WriterConfig::default());
        let peer = Peer {
            stream: theirs,
            buffer: FrameBuffer::new(),
            queued: VecDeque::new(),
        };
        (Multiplexer::new(writer, local), peer)
    }

    fn payload(body: &'static [u8]) -> Payload {
        Payload::new(3, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_open_uses_odd_ids_for_client() {
        let (mux, mut peer) = setup(StreamOrigin::Client);

        let a = mux.open(payload(b"a"), Arc::new(NoopListener)).await.unwrap();
        let b = mux.open(payload(b"b"), Arc::new(NoopListener)).await.unwrap();
        assert_eq!((a.id(), b.id()), (1, 3));
        assert_eq!(a.state(), StreamState::ConnectAwait);

        let frame = peer.next_frame().await;
        assert_eq!(
            frame,
            Frame::StreamCreate {
                stream_id: 1,
                payload: payload(b"a")
            }
        );
    }

    #[tokio::test]
    async fn test_server_ids_are_even() {
        let (mux, _peer) = setup(StreamOrigin::Server);
        let s = mux.open(payload(b"x"), Arc::new(NoopListener)).await.unwrap();
        assert_eq!(s.id(), 2);
    }

    #[tokio::test]
    async fn test_ack_then_data_in_order() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        let (listener, mut rx) = channel();
        let s = mux.open(payload(b"open"), Arc::new(listener)).await.unwrap();

        mux.on_ack(s.id());
        s.wait_connected().await.unwrap();
        for body in [&b"1"[..], b"2", b"3"] {
            mux.on_data(s.id(), Payload::new(3, Bytes::from_static(body)));
        }

        assert_eq!(rx.recv().await, Some(StreamEvent::Connected));
        for body in [&b"1"[..], b"2", b"3"] {
            assert_eq!(
                rx.recv().await,
                Some(StreamEvent::Data(Payload::new(3, Bytes::from_static(body))))
            );
        }
    }

    #[tokio::test]
    async fn test_fail_records_code() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        let s = mux.open(payload(b"x"), Arc::new(NoopListener)).await.unwrap();

        mux.on_fail(s.id(), CreateFailCode::Unsupported);

        assert_eq!(s.fail_code(), Some(CreateFailCode::Unsupported));
        assert_eq!(s.state(), StreamState::Closed);
        assert!(matches!(
            s.wait_connected().await,
            Err(TransportError::StreamRejected {
                code: CreateFailCode::Unsupported,
                ..
            })
        ));
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_data_before_ack_is_illegal() {
        let (mux, mut peer) = setup(StreamOrigin::Client);
        let s = mux.open(payload(b"x"), Arc::new(NoopListener)).await.unwrap();
        let _create = peer.next_frame().await;

        mux.on_data(s.id(), payload(b"early"));

        assert_eq!(s.state(), StreamState::IllegalState);
        assert!(mux.is_empty());
        assert_eq!(
            peer.next_frame().await,
            Frame::StreamClose {
                stream_id: s.id(),
                code: CloseCode::StateError
            }
        );
    }

    #[tokio::test]
    async fn test_double_ack_is_illegal() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        let s = mux.open(payload(b"x"), Arc::new(NoopListener)).await.unwrap();

        mux.on_ack(s.id());
        mux.on_ack(s.id());

        assert_eq!(s.state(), StreamState::IllegalState);
    }

    #[tokio::test]
    async fn test_inbound_create_in_wrong_namespace() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        assert!(mux.on_create(5).is_none());
        assert!(mux.on_create(4).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_create_tears_down() {
        let (mux, _peer) = setup(StreamOrigin::Server);
        let s = mux.on_create(1).unwrap();
        assert_eq!(s.state(), StreamState::ConnectArrived);

        assert!(mux.on_create(1).is_none());
        assert_eq!(s.state(), StreamState::IllegalState);
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_close_unknown_is_tolerated() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        mux.on_close(41, CloseCode::Normal);

        let s = mux.open(payload(b"x"), Arc::new(NoopListener)).await.unwrap();
        mux.on_ack(s.id());
        mux.on_close(s.id(), CloseCode::Normal);
        mux.on_close(s.id(), CloseCode::Normal);
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_close_all() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        let (listener, mut rx) = channel();
        let pending = mux.open(payload(b"x"), Arc::new(listener)).await.unwrap();
        let live = mux.open(payload(b"y"), Arc::new(NoopListener)).await.unwrap();
        mux.on_ack(live.id());

        assert_eq!(mux.close_all(), 2);

        assert_eq!(pending.state(), StreamState::Closed);
        assert_eq!(live.state(), StreamState::Closed);
        assert_eq!(pending.fail_code(), Some(CreateFailCode::ConnectionClosed));
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Closed(CloseCode::ConnectionClosed))
        );
        assert!(matches!(
            mux.open(payload(b"z"), Arc::new(NoopListener)).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_attachment() {
        let (mux, _peer) = setup(StreamOrigin::Client);
        let s = mux.open(payload(b"x"), Arc::new(NoopListener)).await.unwrap();

        s.set_attachment(String::from("trace-42"));
        assert_eq!(*s.attachment::<String>().unwrap(), "trace-42");
        assert!(s.attachment::<u32>().is_none());
    }
}
