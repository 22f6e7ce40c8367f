//! Error types for agentlink.

use thiserror::Error;

use crate::protocol::FrameType;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the socket. Fatal for the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be decoded. Fatal for the connection since the
    /// byte stream can no longer be re-synchronized.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Operation attempted on a client without a live connection.
    #[error("Not connected")]
    NotConnected,

    /// Connection closed while the operation was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request deadline elapsed before a response arrived.
    #[error("Request {0} timed out")]
    RequestTimeout(u32),

    /// Peer answered the handshake with a reject code.
    #[error("Handshake rejected by peer")]
    HandshakeRejected,

    /// Peer did not answer the handshake in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Peer sent something unexpected but recoverable.
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// Stream was rejected by the peer.
    #[error("Stream {stream_id} rejected: {code:?}")]
    StreamRejected {
        /// Stream identifier.
        stream_id: u32,
        /// Reason reported by the peer.
        code: crate::protocol::CreateFailCode,
    },

    /// Operation is not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Frame type not allowed on this link.
    #[error("Unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),

    /// JSON error (handshake properties only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack encoding error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack decoding error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Outbound body larger than the link accepts. Only the offending
    /// operation fails.
    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Encoded body size.
        size: usize,
        /// Negotiated limit.
        limit: u32,
    },

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl TransportError {
    /// Whether this error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::MalformedFrame(_)
        )
    }
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(TransportError::MalformedFrame("x".into()).is_fatal());
        assert!(TransportError::Io(std::io::Error::other("boom")).is_fatal());
        assert!(!TransportError::RequestTimeout(1).is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
        assert!(!TransportError::ProtocolAnomaly("late".into()).is_fatal());
        assert!(!TransportError::PayloadTooLarge { size: 9, limit: 8 }.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransportError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            TransportError::RequestTimeout(7).to_string(),
            "Request 7 timed out"
        );
    }
}
