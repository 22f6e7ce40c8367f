//! Wire format encoding and decoding.
//!
//! Implements the 12-byte header format:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Type     │ Id       │ Code     │ Length   │
//! │ 2 bytes  │ 4 bytes  │ 2 bytes  │ 4 bytes  │
//! │ uint16 BE│ uint32 BE│ uint16 BE│ uint32 BE│
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, TransportError};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Default maximum body size (16 MB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the `[kind u16]` prefix of application payload bodies.
pub const PAYLOAD_KIND_SIZE: usize = 2;

/// Packet type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    /// Fire-and-forget application message.
    Send = 1,
    /// Correlated request.
    Request = 5,
    /// Response to a correlated request.
    Response = 6,
    /// Open a stream channel.
    StreamCreate = 10,
    /// Stream channel accepted.
    StreamCreateAck = 12,
    /// Stream channel rejected.
    StreamCreateFail = 14,
    /// Stream channel closed.
    StreamClose = 15,
    /// Message on an open stream channel.
    StreamData = 16,
    /// Capability handshake request.
    HandshakeRequest = 150,
    /// Capability handshake answer.
    HandshakeResponse = 151,
    /// Keep-alive probe.
    Ping = 200,
    /// Keep-alive answer.
    Pong = 201,
}

impl FrameType {
    /// Raw discriminator.
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw discriminator.
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => FrameType::Send,
            5 => FrameType::Request,
            6 => FrameType::Response,
            10 => FrameType::StreamCreate,
            12 => FrameType::StreamCreateAck,
            14 => FrameType::StreamCreateFail,
            15 => FrameType::StreamClose,
            16 => FrameType::StreamData,
            150 => FrameType::HandshakeRequest,
            151 => FrameType::HandshakeResponse,
            200 => FrameType::Ping,
            201 => FrameType::Pong,
            _ => return None,
        })
    }

    /// Whether the body is a `[kind][bytes]` payload envelope.
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            FrameType::Send
                | FrameType::Request
                | FrameType::Response
                | FrameType::StreamCreate
                | FrameType::StreamData
        )
    }

    /// Whether the frame may have a body at all.
    pub fn has_body(self) -> bool {
        self.carries_payload()
            || matches!(
                self,
                FrameType::HandshakeRequest | FrameType::HandshakeResponse
            )
    }

    /// Whether the `id` header field is meaningful for this type.
    pub fn uses_id(self) -> bool {
        !matches!(self, FrameType::Send)
    }

    /// Whether the `code` header field is meaningful for this type.
    pub fn uses_code(self) -> bool {
        matches!(
            self,
            FrameType::HandshakeResponse | FrameType::StreamCreateFail | FrameType::StreamClose
        )
    }
}

/// Handshake answer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HandshakeCode {
    /// Accepted; the link carries commands in both directions.
    SuccessDuplex = 1,
    /// Accepted; the link is outbound-only from the agent.
    SuccessSimplex = 2,
    /// Refused.
    Reject = 3,
}

impl HandshakeCode {
    /// Parse a raw code.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(HandshakeCode::SuccessDuplex),
            2 => Some(HandshakeCode::SuccessSimplex),
            3 => Some(HandshakeCode::Reject),
            _ => None,
        }
    }

    /// Whether the handshake succeeded.
    pub fn is_success(self) -> bool {
        !matches!(self, HandshakeCode::Reject)
    }
}

/// Reasons for rejecting a stream create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CreateFailCode {
    /// No handler for the payload kind.
    TypeUnknown = 1,
    /// Handler refused the stream.
    Unsupported = 2,
    /// Streams are not accepted on this link.
    ChannelUnsupported = 3,
    /// Connection closed before the stream was accepted.
    ConnectionClosed = 4,
}

impl CreateFailCode {
    /// Parse a raw code.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(CreateFailCode::TypeUnknown),
            2 => Some(CreateFailCode::Unsupported),
            3 => Some(CreateFailCode::ChannelUnsupported),
            4 => Some(CreateFailCode::ConnectionClosed),
            _ => None,
        }
    }
}

/// Reasons carried by a stream close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum CloseCode {
    /// Orderly close.
    #[default]
    Normal = 0,
    /// Closed after a state violation.
    StateError = 1,
    /// Closed because the connection went away.
    ConnectionClosed = 2,
}

impl CloseCode {
    /// Parse a raw code.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(CloseCode::Normal),
            1 => Some(CloseCode::StateError),
            2 => Some(CloseCode::ConnectionClosed),
            _ => None,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw packet type.
    pub frame_type: u16,
    /// Correlation, stream or ping identifier (0 when unused).
    pub id: u32,
    /// Type specific code (0 when unused).
    pub code: u16,
    /// Body length in bytes.
    pub body_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(frame_type: FrameType, id: u32, code: u16, body_length: u32) -> Self {
        Self {
            frame_type: frame_type.as_u16(),
            id,
            code,
            body_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use agentlink::protocol::{FrameType, Header};
    ///
    /// let header = Header::new(FrameType::Request, 42, 0, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 12);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.frame_type.to_be_bytes());
        buf[2..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.code.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            frame_type: u16::from_be_bytes([buf[0], buf[1]]),
            id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            code: u16::from_be_bytes([buf[6], buf[7]]),
            body_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Type is known
    /// - Body length doesn't exceed max, and is zero for body-less types
    /// - Payload bodies are at least as long as the kind prefix
    /// - Unused id/code fields are 0, used codes are known
    pub fn validate(&self, max_body_size: u32) -> Result<FrameType> {
        let frame_type = FrameType::from_u16(self.frame_type).ok_or_else(|| {
            TransportError::MalformedFrame(format!("Unknown frame type {}", self.frame_type))
        })?;

        if self.body_length > max_body_size {
            return Err(TransportError::MalformedFrame(format!(
                "Body size {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }

        if !frame_type.has_body() && self.body_length != 0 {
            return Err(TransportError::MalformedFrame(format!(
                "{:?} frame must not carry a body",
                frame_type
            )));
        }

        if frame_type.carries_payload() && (self.body_length as usize) < PAYLOAD_KIND_SIZE {
            return Err(TransportError::MalformedFrame(format!(
                "{:?} body shorter than payload kind",
                frame_type
            )));
        }

        if !frame_type.uses_id() && self.id != 0 {
            return Err(TransportError::MalformedFrame(format!(
                "{:?} frame must have id 0",
                frame_type
            )));
        }

        let code_known = match frame_type {
            FrameType::HandshakeResponse => HandshakeCode::from_u16(self.code).is_some(),
            FrameType::StreamCreateFail => CreateFailCode::from_u16(self.code).is_some(),
            FrameType::StreamClose => CloseCode::from_u16(self.code).is_some(),
            _ => self.code == 0,
        };
        if !code_known {
            return Err(TransportError::MalformedFrame(format!(
                "Invalid code {} for {:?}",
                self.code, frame_type
            )));
        }

        Ok(frame_type)
    }
}
