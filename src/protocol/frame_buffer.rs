//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. Socket reads
//! are appended as they arrive; complete frames are split off the front
//! and partial data stays buffered for the next push.
//!
//! # Example
//!
//! ```
//! use agentlink::protocol::{Frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = Frame::Ping { ping_id: 1 }.encode();
//!
//! assert!(buffer.push(&wire[..5]).unwrap().is_empty());
//! let frames = buffer.push(&wire[5..]).unwrap();
//! assert_eq!(frames, vec![Frame::Ping { ping_id: 1 }]);
//! ```

use bytes::BytesMut;

use super::frame::Frame;
use super::wire_format::DEFAULT_MAX_BODY_SIZE;
use crate::error::Result;

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 16MB.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames (may be empty if still waiting
    /// for data).
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` on the first invalid frame. The buffer
    /// cannot be re-synchronized after that and should be discarded.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = Frame::decode(&mut self.buffer, self.max_body_size)? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::{FrameType, Header, Payload, HEADER_SIZE};
    use bytes::Bytes;

    fn data_frame(stream_id: u32, body: &'static [u8]) -> Frame {
        Frame::StreamData {
            stream_id,
            payload: Payload::new(1, Bytes::from_static(body)),
        }
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = Vec::new();
        for i in 1..=3 {
            combined.extend_from_slice(&data_frame(i, b"chunk").encode());
        }

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream_id(), Some(1));
        assert_eq!(frames[2].stream_id(), Some(3));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = data_frame(5, b"test").encode();

        assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
        assert_eq!(buffer.len(), 5);

        let frames = buffer.push(&bytes[5..]).unwrap();
        assert_eq!(frames, vec![data_frame(5, b"test")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let bytes = data_frame(1, b"this is a longer body that will be fragmented").encode();

        let partial = HEADER_SIZE + 10;
        assert!(buffer.push(&bytes[..partial]).unwrap().is_empty());

        let frames = buffer.push(&bytes[partial..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let frame = Frame::Request {
            request_id: 42,
            payload: Payload::new(9, Bytes::from_static(b"hi")),
        };

        let mut all_frames = Vec::new();
        for byte in frame.encode().iter() {
            all_frames.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_frames, vec![frame]);
    }

    #[test]
    fn test_max_body_validation() {
        let mut buffer = FrameBuffer::with_max_body(100);
        let header = Header::new(FrameType::Send, 0, 0, 1000);

        let err = buffer.push(&header.encode()).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = Frame::Ping { ping_id: 1 }.encode();
        let second = data_frame(2, b"second").encode();

        let mut data = first.to_vec();
        data.extend_from_slice(&second[..5]);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames, vec![Frame::Ping { ping_id: 1 }]);

        let frames = buffer.push(&second[5..]).unwrap();
        assert_eq!(frames, vec![data_frame(2, b"second")]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0, 1, 0]).unwrap();
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
