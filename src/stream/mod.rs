//! Stream channels multiplexed over one connection.
//!
//! Each stream has its own predecessor-table state machine:
//!
//! ```text
//! New ─► Open ─┬─► ConnectAwait ───┬─► Connected ─► Closed
//!              └─► ConnectArrived ─┘        (either await/arrived may close)
//!
//! any ─► IllegalState   (rejected transition; channel is torn down)
//! ```
//!
//! The opener moves to `ConnectAwait` after sending `StreamCreate`; the
//! accepting side sits in `ConnectArrived` until its handler decides.
//! Client-initiated streams use odd IDs and server-initiated streams use
//! even IDs, so both sides can open streams without coordination.

mod channel;
mod multiplexer;

use tokio::sync::mpsc;

use crate::protocol::{CloseCode, CreateFailCode, Payload};
use crate::state::StateTable;

pub use channel::StreamContext;
pub use multiplexer::Multiplexer;

/// State of one stream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Allocated, nothing sent.
    New,
    /// Registered on the connection.
    Open,
    /// Opener sent `StreamCreate` and waits for the peer's answer.
    ConnectAwait,
    /// Peer's `StreamCreate` arrived; local accept decision pending.
    ConnectArrived,
    /// Both sides agreed; data may flow.
    Connected,
    /// Terminal.
    Closed,
    /// A frame arrived that the table does not allow.
    IllegalState,
}

impl StreamState {
    /// Whether `StreamData` may be sent or received.
    pub fn accepts_data(self) -> bool {
        self == StreamState::Connected
    }

    /// Whether the channel has reached an end state.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::IllegalState)
    }
}

impl StateTable for StreamState {
    fn predecessors(self) -> &'static [Self] {
        use StreamState::*;
        match self {
            New => &[],
            Open => &[New],
            ConnectAwait | ConnectArrived => &[Open],
            Connected => &[ConnectAwait, ConnectArrived],
            Closed => &[ConnectAwait, ConnectArrived, Connected],
            IllegalState => &[
                New,
                Open,
                ConnectAwait,
                ConnectArrived,
                Connected,
                Closed,
                IllegalState,
            ],
        }
    }

    fn illegal_state() -> Option<Self> {
        Some(StreamState::IllegalState)
    }
}

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Opened by the connecting side (odd IDs).
    Client,
    /// Opened by the accepting side (even IDs).
    Server,
}

impl StreamOrigin {
    /// Origin implied by a stream ID.
    pub fn of(stream_id: u32) -> Self {
        if stream_id % 2 == 1 {
            StreamOrigin::Client
        } else {
            StreamOrigin::Server
        }
    }

    /// First ID in this origin's namespace.
    pub(crate) fn first_id(self) -> u32 {
        match self {
            StreamOrigin::Client => 1,
            StreamOrigin::Server => 2,
        }
    }
}

/// Something that happened on a stream, delivered to its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream reached `Connected`.
    Connected,
    /// The peer refused the stream.
    Rejected(CreateFailCode),
    /// Inbound data, in arrival order.
    Data(Payload),
    /// The stream closed, locally or by the peer.
    Closed(CloseCode),
}

/// Receives the events of one stream.
///
/// Called on the connection's reader task, so implementations must return
/// quickly. Forward to a channel (see [`channel`]) for anything slower.
pub trait StreamListener: Send + Sync + 'static {
    /// Handle one event.
    fn on_event(&self, stream: &StreamContext, event: StreamEvent);
}

impl<F> StreamListener for F
where
    F: Fn(&StreamContext, StreamEvent) + Send + Sync + 'static,
{
    fn on_event(&self, stream: &StreamContext, event: StreamEvent) {
        self(stream, event)
    }
}

/// Listener that forwards events into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamListener for ChannelListener {
    fn on_event(&self, stream: &StreamContext, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("stream {} receiver dropped", stream.id());
        }
    }
}

/// Create a listener whose events are read from the returned receiver.
pub fn channel() -> (ChannelListener, mpsc::UnboundedReceiver<StreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelListener { tx }, rx)
}

/// Listener that discards everything.
pub struct NoopListener;

impl StreamListener for NoopListener {
    fn on_event(&self, _stream: &StreamContext, _event: StreamEvent) {}
}
