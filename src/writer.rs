//! Dedicated writer task: the single write path of a connection.
//!
//! Every caller (application tasks, request handlers, the reader answering
//! pings) hands encoded frames to one writer task over an mpsc channel, so
//! frames are never interleaved mid-write and callers never contend on a
//! socket lock.
//!
//! ```text
//! send()/request()  ─┐
//! stream contexts   ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! reader (pong/ack) ─┘
//! ```
//!
//! Ready frames are batched and written with one vectored write.

use std::io::IoSlice;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, HEADER_SIZE, PAYLOAD_KIND_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

const HEAD_CAPACITY: usize = HEADER_SIZE + PAYLOAD_KIND_SIZE;

/// A frame ready to be written to the socket.
///
/// The header and payload kind are pre-encoded into `head`; the payload
/// body is kept as shared `Bytes` so it is never copied.
#[derive(Debug)]
pub struct OutboundFrame {
    head: [u8; HEAD_CAPACITY],
    head_len: usize,
    body: Bytes,
}

impl OutboundFrame {
    /// Pre-encode a frame.
    pub fn new(frame: &Frame) -> Self {
        let mut head = [0u8; HEAD_CAPACITY];
        frame.header().encode_into(&mut head);

        let (head_len, body) = match frame {
            Frame::HandshakeRequest { properties, .. }
            | Frame::HandshakeResponse { properties, .. } => (HEADER_SIZE, properties.clone()),
            _ => match frame.payload() {
                Some(payload) => {
                    head[HEADER_SIZE..].copy_from_slice(&payload.kind().to_be_bytes());
                    (HEAD_CAPACITY, payload.body_bytes())
                }
                None => (HEADER_SIZE, Bytes::new()),
            },
        };

        Self {
            head,
            head_len,
            body,
        }
    }

    /// Header (and payload kind) bytes.
    #[inline]
    pub fn head(&self) -> &[u8] {
        &self.head[..self.head_len]
    }

    /// Body bytes following the head.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.head_len + self.body.len()
    }
}

impl From<&Frame> for OutboundFrame {
    fn from(frame: &Frame) -> Self {
        OutboundFrame::new(frame)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by every sender on one connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
    body_limit: Arc<AtomicU32>,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
            body_limit: Arc::new(AtomicU32::new(u32::MAX)),
        }
    }

    /// Lower the largest body this handle will queue. Never raises it.
    pub(crate) fn limit_body(&self, limit: u32) {
        self.body_limit.fetch_min(limit, Ordering::AcqRel);
    }

    /// Largest body this handle will queue.
    pub fn body_limit(&self) -> u32 {
        self.body_limit.load(Ordering::Acquire)
    }

    /// Refuse a frame the peer would reject as malformed.
    fn check_size(&self, frame: &Frame) -> Result<()> {
        let size = frame.body_len();
        let limit = self.body_limit();
        if size > limit as usize {
            return Err(TransportError::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    /// Queue a frame, waiting while backpressure is active.
    ///
    /// Returns once the frame is queued, not once it is on the wire.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` when the body exceeds [`body_limit`](Self::body_limit);
    /// nothing is queued and the connection stays usable.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.check_size(frame)?;
        self.send_outbound(OutboundFrame::new(frame)).await
    }

    /// Queue a pre-encoded frame.
    pub async fn send_outbound(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            TransportError::ConnectionClosed
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if self.tx.is_closed() {
                return Err(TransportError::ConnectionClosed);
            }

            if start.elapsed() > self.timeout {
                return Err(TransportError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Queue a frame without waiting.
    ///
    /// Used from the reader task, which must never block on the socket.
    pub fn try_send(&self, frame: &Frame) -> Result<()> {
        self.check_size(frame)?;
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(TransportError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(OutboundFrame::new(frame)).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => TransportError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
            }
        })
    }

    /// Queue a control frame from a task that must not wait.
    ///
    /// Falls back to a detached send when the queue is full, so the frame
    /// is delayed rather than lost.
    pub fn send_nowait(&self, frame: Frame) {
        match self.try_send(&frame) {
            Ok(()) => {}
            Err(TransportError::BackpressureTimeout) => {
                let handle = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.send(&frame).await {
                        tracing::debug!("dropping {:?} frame: {}", frame.frame_type(), e);
                    }
                });
            }
            Err(e) => {
                tracing::debug!("dropping {:?} frame: {}", frame.frame_type(), e);
            }
        }
    }

    /// Wait until every queued frame has been written, up to `timeout`.
    ///
    /// Returns `false` if frames were still pending when time ran out.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.pending.load(Ordering::Acquire) > 0 {
            if self.tx.is_closed() || start.elapsed() > timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        while let Some(first) = rx.recv().await {
            let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
            batch.push(first);

            while batch.len() < MAX_BATCH_SIZE {
                match rx.try_recv() {
                    Ok(frame) => batch.push(frame),
                    Err(_) => break,
                }
            }

            let batch_size = batch.len();
            write_batch(&mut writer, &batch).await?;
            pending.fetch_sub(batch_size, Ordering::Release);
        }
        Ok(())
    }
    .await;

    if let Err(e) = &result {
        tracing::debug!("writer stopped: {}", e);
    }
    let _ = writer.shutdown().await;
    result
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [frame.head(), frame.body()] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, Payload};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn data(stream_id: u32) -> Frame {
        Frame::StreamData {
            stream_id,
            payload: Payload::new(1, Bytes::from_static(b"hello")),
        }
    }

    #[test]
    fn test_outbound_frame_matches_encode() {
        let frames = [
            data(1),
            Frame::Ping { ping_id: 3 },
            Frame::HandshakeRequest {
                request_id: 1,
                properties: Bytes::from_static(b"{}"),
            },
        ];
        for frame in frames {
            let out = OutboundFrame::new(&frame);
            let mut joined = out.head().to_vec();
            joined.extend_from_slice(out.body());
            assert_eq!(joined, frame.encode().to_vec());
            assert_eq!(out.size(), joined.len());
        }
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u32 {
            handle.send(&data(i)).await.unwrap();
        }

        let expected = 10 * data(0).encode().len();
        let mut received = vec![0u8; expected];
        server.read_exact(&mut received).await.unwrap();

        let frames = FrameBuffer::new().push(&received).unwrap();
        let ids: Vec<_> = frames.iter().filter_map(Frame::stream_id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(tx, pending, 100, Duration::from_secs(1));

        let result = handle.try_send(&Frame::Pong { ping_id: 1 });
        assert!(matches!(result, Err(TransportError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused_before_queueing() {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), 10, Duration::ZERO);
        handle.limit_body(64);
        handle.limit_body(1024);
        assert_eq!(handle.body_limit(), 64);

        let big = Frame::Send(Payload::new(7, vec![0u8; 100]));
        let result = handle.send(&big).await;
        assert!(matches!(
            result,
            Err(TransportError::PayloadTooLarge { size: 102, limit: 64 })
        ));
        assert_eq!(handle.pending_count(), 0);
        assert!(rx.try_recv().is_err());

        handle.send(&Frame::Send(Payload::new(7, vec![0u8; 62]))).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().body().len(), 62);
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(10);
        drop(rx);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), 10, Duration::ZERO);

        let result = handle.send(&Frame::Ping { ping_id: 1 }).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![OutboundFrame::new(&data(1))];
        let head_len = batch[0].head().len();

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let partial = build_remaining_slices(&batch, 5);
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[0].len(), head_len - 5);

        let body_only = build_remaining_slices(&batch, head_len);
        assert_eq!(body_only.len(), 1);
        assert_eq!(body_only[0].len(), 5);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| OutboundFrame::new(&data(i))).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * data(0).encode().len());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
