//! Typed frames.
//!
//! A [`Frame`] is the decoded form of one header + body on the wire.
//! Application bodies stay as `bytes::Bytes`, so decoding a frame never
//! copies the payload.
//!
//! # Example
//!
//! ```
//! use agentlink::protocol::{Frame, Payload};
//! use bytes::BytesMut;
//!
//! let frame = Frame::Request { request_id: 42, payload: Payload::new(7, &b"hello"[..]) };
//! let mut wire = BytesMut::from(&frame.encode()[..]);
//!
//! let decoded = Frame::decode(&mut wire, 1024).unwrap().unwrap();
//! assert_eq!(decoded, frame);
//! ```

use bytes::{Bytes, BytesMut};

use super::payload::Payload;
use super::wire_format::{
    CloseCode, CreateFailCode, FrameType, HandshakeCode, Header, HEADER_SIZE,
};
use crate::error::{Result, TransportError};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Fire-and-forget message.
    Send(Payload),
    /// Correlated request.
    Request {
        /// Correlation ID.
        request_id: u32,
        /// Request payload.
        payload: Payload,
    },
    /// Answer to a correlated request.
    Response {
        /// Correlation ID of the request being answered.
        request_id: u32,
        /// Response payload.
        payload: Payload,
    },
    /// Open a stream channel.
    StreamCreate {
        /// Stream ID chosen by the opener.
        stream_id: u32,
        /// Open payload, routed by kind on the receiving side.
        payload: Payload,
    },
    /// Stream accepted.
    StreamCreateAck {
        /// Stream ID.
        stream_id: u32,
    },
    /// Stream rejected.
    StreamCreateFail {
        /// Stream ID.
        stream_id: u32,
        /// Rejection reason.
        code: CreateFailCode,
    },
    /// Message on an open stream.
    StreamData {
        /// Stream ID.
        stream_id: u32,
        /// Message payload.
        payload: Payload,
    },
    /// Stream closed by the sender.
    StreamClose {
        /// Stream ID.
        stream_id: u32,
        /// Close reason.
        code: CloseCode,
    },
    /// Handshake property map (JSON object).
    HandshakeRequest {
        /// Correlation ID.
        request_id: u32,
        /// Encoded properties.
        properties: Bytes,
    },
    /// Handshake answer.
    HandshakeResponse {
        /// Correlation ID of the handshake request.
        request_id: u32,
        /// Negotiated mode or reject.
        code: HandshakeCode,
        /// Encoded server properties (may be empty).
        properties: Bytes,
    },
    /// Keep-alive probe.
    Ping {
        /// Probe identifier echoed by the pong.
        ping_id: u32,
    },
    /// Keep-alive answer.
    Pong {
        /// Identifier of the answered ping.
        ping_id: u32,
    },
}

impl Frame {
    /// Packet type of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Send(_) => FrameType::Send,
            Frame::Request { .. } => FrameType::Request,
            Frame::Response { .. } => FrameType::Response,
            Frame::StreamCreate { .. } => FrameType::StreamCreate,
            Frame::StreamCreateAck { .. } => FrameType::StreamCreateAck,
            Frame::StreamCreateFail { .. } => FrameType::StreamCreateFail,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::StreamClose { .. } => FrameType::StreamClose,
            Frame::HandshakeRequest { .. } => FrameType::HandshakeRequest,
            Frame::HandshakeResponse { .. } => FrameType::HandshakeResponse,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Stream ID for stream frames.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::StreamCreate { stream_id, .. }
            | Frame::StreamCreateAck { stream_id }
            | Frame::StreamCreateFail { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamClose { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Header `id` field.
    fn id(&self) -> u32 {
        match self {
            Frame::Send(_) => 0,
            Frame::Request { request_id, .. }
            | Frame::Response { request_id, .. }
            | Frame::HandshakeRequest { request_id, .. }
            | Frame::HandshakeResponse { request_id, .. } => *request_id,
            Frame::Ping { ping_id } | Frame::Pong { ping_id } => *ping_id,
            Frame::StreamCreate { stream_id, .. }
            | Frame::StreamCreateAck { stream_id }
            | Frame::StreamCreateFail { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamClose { stream_id, .. } => *stream_id,
        }
    }

    /// Header `code` field.
    fn code(&self) -> u16 {
        match self {
            Frame::HandshakeResponse { code, .. } => *code as u16,
            Frame::StreamCreateFail { code, .. } => *code as u16,
            Frame::StreamClose { code, .. } => *code as u16,
            _ => 0,
        }
    }

    /// Application payload, if this frame carries one.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Frame::Send(payload)
            | Frame::Request { payload, .. }
            | Frame::Response { payload, .. }
            | Frame::StreamCreate { payload, .. }
            | Frame::StreamData { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Raw (non-envelope) body, for handshake frames.
    fn raw_body(&self) -> Option<&Bytes> {
        match self {
            Frame::HandshakeRequest { properties, .. }
            | Frame::HandshakeResponse { properties, .. } => Some(properties),
            _ => None,
        }
    }

    /// Length of the body on the wire.
    pub fn body_len(&self) -> usize {
        match (self.payload(), self.raw_body()) {
            (Some(payload), _) => payload.encoded_len(),
            (None, Some(raw)) => raw.len(),
            (None, None) => 0,
        }
    }

    /// Header describing this frame.
    pub fn header(&self) -> Header {
        Header::new(
            self.frame_type(),
            self.id(),
            self.code(),
            u32::try_from(self.body_len()).unwrap_or(u32::MAX),
        )
    }

    /// Encode into a single contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.header().encode());
        if let Some(payload) = self.payload() {
            payload.write_to(buf);
        } else if let Some(raw) = self.raw_body() {
            buf.extend_from_slice(raw);
        }
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` and consumes the frame's bytes if complete
    /// - `Ok(None)` without consuming anything if more bytes are needed
    /// - `Err(MalformedFrame)` if the bytes can never form a valid frame
    pub fn decode(buf: &mut BytesMut, max_body_size: u32) -> Result<Option<Frame>> {
        let Some(header) = Header::decode(&buf[..]) else {
            return Ok(None);
        };
        let frame_type = header.validate(max_body_size)?;

        let total = HEADER_SIZE + header.body_length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let _ = buf.split_to(HEADER_SIZE);
        let body = buf.split_to(header.body_length as usize).freeze();
        Self::from_parts(frame_type, &header, body).map(Some)
    }

    /// Build a frame from a validated header and its body.
    pub fn from_parts(frame_type: FrameType, header: &Header, body: Bytes) -> Result<Frame> {
        let id = header.id;
        let frame = match frame_type {
            FrameType::Send => Frame::Send(Payload::parse(body)?),
            FrameType::Request => Frame::Request {
                request_id: id,
                payload: Payload::parse(body)?,
            },
            FrameType::Response => Frame::Response {
                request_id: id,
                payload: Payload::parse(body)?,
            },
            FrameType::StreamCreate => Frame::StreamCreate {
                stream_id: id,
                payload: Payload::parse(body)?,
            },
            FrameType::StreamCreateAck => Frame::StreamCreateAck { stream_id: id },
            FrameType::StreamCreateFail => Frame::StreamCreateFail {
                stream_id: id,
                code: CreateFailCode::from_u16(header.code).ok_or_else(|| bad_code(header))?,
            },
            FrameType::StreamData => Frame::StreamData {
                stream_id: id,
                payload: Payload::parse(body)?,
            },
            FrameType::StreamClose => Frame::StreamClose {
                stream_id: id,
                code: CloseCode::from_u16(header.code).ok_or_else(|| bad_code(header))?,
            },
            FrameType::HandshakeRequest => Frame::HandshakeRequest {
                request_id: id,
                properties: body,
            },
            FrameType::HandshakeResponse => Frame::HandshakeResponse {
                request_id: id,
                code: HandshakeCode::from_u16(header.code).ok_or_else(|| bad_code(header))?,
                properties: body,
            },
            FrameType::Ping => Frame::Ping { ping_id: id },
            FrameType::Pong => Frame::Pong { ping_id: id },
        };
        Ok(frame)
    }
}

fn bad_code(header: &Header) -> TransportError {
    TransportError::MalformedFrame(format!(
        "Invalid code {} for type {}",
        header.code, header.frame_type
    ))
}

/// Encode a frame (standalone function).
#[inline]
pub fn encode(frame: &Frame) -> Bytes {
    frame.encode()
}

/// Decode a frame from the front of `buf` (standalone function).
#[inline]
pub fn decode(buf: &mut BytesMut, max_body_size: u32) -> Result<Option<Frame>> {
    Frame::decode(buf, max_body_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_BODY_SIZE;

    fn all_frames() -> Vec<Frame> {
        let payload = Payload::new(3, Bytes::from_static(b"span"));
        vec![
            Frame::Send(payload.clone()),
            Frame::Request {
                request_id: 1,
                payload: payload.clone(),
            },
            Frame::Response {
                request_id: u32::MAX,
                payload: Payload::empty(4),
            },
            Frame::StreamCreate {
                stream_id: 1,
                payload: payload.clone(),
            },
            Frame::StreamCreateAck { stream_id: 1 },
            Frame::StreamCreateFail {
                stream_id: 3,
                code: CreateFailCode::ChannelUnsupported,
            },
            Frame::StreamData {
                stream_id: 1,
                payload,
            },
            Frame::StreamClose {
                stream_id: 1,
                code: CloseCode::StateError,
            },
            Frame::HandshakeRequest {
                request_id: 9,
                properties: Bytes::from_static(br#"{"agentId":"a"}"#),
            },
            Frame::HandshakeResponse {
                request_id: 9,
                code: HandshakeCode::SuccessSimplex,
                properties: Bytes::new(),
            },
            Frame::Ping { ping_id: 5 },
            Frame::Pong { ping_id: 5 },
        ]
    }

    #[test]
    fn test_roundtrip_every_frame_kind() {
        for frame in all_frames() {
            let mut buf = BytesMut::from(&frame.encode()[..]);
            let decoded = Frame::decode(&mut buf, DEFAULT_MAX_BODY_SIZE)
                .unwrap()
                .unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(decoded.frame_type(), frame.frame_type());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_need_more_data_does_not_consume() {
        let frame = Frame::Request {
            request_id: 11,
            payload: Payload::new(1, Bytes::from_static(b"payload")),
        };
        let encoded = frame.encode();

        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(Frame::decode(&mut buf, DEFAULT_MAX_BODY_SIZE)
                .unwrap()
                .is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_malformed_distinct_from_need_more() {
        let mut buf = BytesMut::from(&[0xFFu8; HEADER_SIZE][..]);
        let err = Frame::decode(&mut buf, DEFAULT_MAX_BODY_SIZE).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn test_header_only_frames_have_empty_body() {
        let frame = Frame::StreamCreateAck { stream_id: 77 };
        assert_eq!(frame.encode().len(), HEADER_SIZE);
        assert_eq!(frame.stream_id(), Some(77));
        assert!(frame.payload().is_none());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        Frame::Ping { ping_id: 1 }.encode_into(&mut buf);
        Frame::Pong { ping_id: 1 }.encode_into(&mut buf);

        let first = Frame::decode(&mut buf, DEFAULT_MAX_BODY_SIZE).unwrap();
        let second = Frame::decode(&mut buf, DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(first, Some(Frame::Ping { ping_id: 1 }));
        assert_eq!(second, Some(Frame::Pong { ping_id: 1 }));
        assert!(Frame::decode(&mut buf, DEFAULT_MAX_BODY_SIZE)
            .unwrap()
            .is_none());
    }
}
