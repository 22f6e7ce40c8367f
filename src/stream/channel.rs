use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::multiplexer::Multiplexer;
use super::{StreamEvent, StreamListener, StreamOrigin, StreamState};
use crate::error::{Result, TransportError};
use crate::protocol::{CloseCode, CreateFailCode, Frame, Payload};
use crate::state::{IllegalTransition, StateCell};

type Attachment = Arc<dyn Any + Send + Sync>;

/// Per-stream bookkeeping shared by the multiplexer and every context.
pub(crate) struct StreamChannel {
    id: u32,
    origin: StreamOrigin,
    state: StateCell<StreamState>,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    fail_code: Mutex<Option<CreateFailCode>>,
    close_code: Mutex<Option<CloseCode>>,
    attachment: Mutex<Option<Attachment>>,
    changed: Notify,
}

impl StreamChannel {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            origin: StreamOrigin::of(id),
            state: StateCell::new(StreamState::New),
            listener: Mutex::new(None),
            fail_code: Mutex::new(None),
            close_code: Mutex::new(None),
            attachment: Mutex::new(None),
            changed: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn origin(&self) -> StreamOrigin {
        self.origin
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state.get()
    }

    pub(crate) fn transition(
        &self,
        to: StreamState,
    ) -> std::result::Result<StreamState, IllegalTransition<StreamState>> {
        let result = self.state.transition(to);
        self.changed.notify_waiters();
        result
    }

    pub(crate) fn try_transition(&self, to: StreamState) -> Option<StreamState> {
        let result = self.state.try_transition(to);
        if result.is_some() {
            self.changed.notify_waiters();
        }
        result
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn record_fail(&self, code: CreateFailCode) {
        *self.fail_code.lock() = Some(code);
    }

    pub(crate) fn record_close(&self, code: CloseCode) {
        self.close_code.lock().get_or_insert(code);
    }
}

/// Handle to one stream channel.
///
/// Cloneable; every clone refers to the same channel. Handed to listeners,
/// to stream handlers, and returned by `open_stream`.
#[derive(Clone)]
pub struct StreamContext {
    channel: Arc<StreamChannel>,
    mux: Arc<Multiplexer>,
}

impl StreamContext {
    pub(crate) fn new(channel: Arc<StreamChannel>, mux: Arc<Multiplexer>) -> Self {
        Self { channel, mux }
    }

    pub(crate) fn channel(&self) -> &Arc<StreamChannel> {
        &self.channel
    }

    /// Stream ID.
    pub fn id(&self) -> u32 {
        self.channel.id
    }

    /// Which side opened the stream.
    pub fn origin(&self) -> StreamOrigin {
        self.channel.origin
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.channel.state()
    }

    /// Whether data may flow.
    pub fn is_connected(&self) -> bool {
        self.state().accepts_data()
    }

    /// Code the peer gave when it refused this stream.
    pub fn fail_code(&self) -> Option<CreateFailCode> {
        *self.channel.fail_code.lock()
    }

    /// Code the stream was closed with.
    pub fn close_code(&self) -> Option<CloseCode> {
        *self.channel.close_code.lock()
    }

    /// Install the listener for this stream's events.
    ///
    /// Stream handlers call this before accepting; openers pass the
    /// listener to `open_stream` instead.
    pub fn set_listener(&self, listener: impl StreamListener) {
        self.channel.set_listener(Arc::new(listener));
    }

    /// Attach an application object to the stream.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) {
        *self.channel.attachment.lock() = Some(Arc::new(value));
    }

    /// Fetch the attached object, if one of type `T` is present.
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let attached = self.channel.attachment.lock().clone()?;
        attached.downcast::<T>().ok()
    }

    /// Send one data payload.
    ///
    /// # Errors
    ///
    /// `IllegalState` unless the stream is `Connected`.
    pub async fn send(&self, payload: Payload) -> Result<()> {
        let state = self.state();
        if !state.accepts_data() {
            return Err(TransportError::IllegalState(format!(
                "stream {} is {:?}",
                self.id(),
                state
            )));
        }
        self.mux
            .writer()
            .send(&Frame::StreamData {
                stream_id: self.id(),
                payload,
            })
            .await
    }

    /// Close with [`CloseCode::Normal`].
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal).await
    }

    /// Close and tell the peer why.
    ///
    /// Closing a stream that is already closed is a logged no-op.
    pub async fn close_with(&self, code: CloseCode) -> Result<()> {
        if self.channel.try_transition(StreamState::Closed).is_none() {
            tracing::debug!(
                "stream {} close ignored in state {:?}",
                self.id(),
                self.state()
            );
            return Ok(());
        }

        self.channel.record_close(code);
        self.mux.remove(self.id());
        let sent = self
            .mux
            .writer()
            .send(&Frame::StreamClose {
                stream_id: self.id(),
                code,
            })
            .await;
        self.emit(StreamEvent::Closed(code));
        sent
    }

    /// Wait until the stream is `Connected`.
    ///
    /// # Errors
    ///
    /// `StreamRejected` when the peer refused it, `ConnectionClosed` or
    /// `IllegalState` when it ended before connecting.
    pub async fn wait_connected(&self) -> Result<()> {
        loop {
            let notified = self.channel.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state() {
                StreamState::Connected => return Ok(()),
                StreamState::Closed | StreamState::IllegalState => {
                    return Err(match self.fail_code() {
                        Some(code) => TransportError::StreamRejected {
                            stream_id: self.id(),
                            code,
                        },
                        None if self.close_code() == Some(CloseCode::ConnectionClosed) => {
                            TransportError::ConnectionClosed
                        }
                        None => TransportError::IllegalState(format!(
                            "stream {} ended in {:?}",
                            self.id(),
                            self.state()
                        )),
                    });
                }
                _ => {}
            }

            notified.await;
        }
    }

    /// Accept a stream the peer opened.
    pub(crate) async fn accept(&self) -> Result<()> {
        if self.channel.try_transition(StreamState::Connected).is_none() {
            tracing::debug!(
                "stream {} accept ignored in state {:?}",
                self.id(),
                self.state()
            );
            return Err(TransportError::ConnectionClosed);
        }
        self.mux
            .writer()
            .send(&Frame::StreamCreateAck {
                stream_id: self.id(),
            })
            .await?;
        self.emit(StreamEvent::Connected);
        Ok(())
    }

    /// Refuse a stream the peer opened.
    pub(crate) fn reject(&self, code: CreateFailCode) {
        if self.channel.try_transition(StreamState::Closed).is_none() {
            return;
        }
        self.channel.record_fail(code);
        self.mux.remove(self.id());
        self.mux.writer().send_nowait(Frame::StreamCreateFail {
            stream_id: self.id(),
            code,
        });
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let listener = self.channel.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_event(self, event);
        }
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("id", &self.id())
            .field("origin", &self.origin())
            .field("state", &self.state())
            .finish()
    }
}
