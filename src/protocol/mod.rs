//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the packet codec:
//! - 12-byte header encoding/decoding and validation
//! - [`Frame`], the typed packet taxonomy
//! - [`Payload`], the `[kind][bytes]` application envelope
//! - [`FrameBuffer`] for accumulating partial reads

mod frame;
mod frame_buffer;
mod payload;
mod wire_format;

pub use frame::{decode, encode, Frame};
pub use frame_buffer::FrameBuffer;
pub use payload::{Payload, UNSUPPORTED_KIND};
pub use wire_format::{
    CloseCode, CreateFailCode, FrameType, HandshakeCode, Header, DEFAULT_MAX_BODY_SIZE,
    HEADER_SIZE, PAYLOAD_KIND_SIZE,
};
