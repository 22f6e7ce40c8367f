//! Application payload envelope.
//!
//! Application frames carry an opaque body prefixed by a 2-byte kind
//! discriminator. The transport never looks inside the body; routing on
//! the receiving side only uses the kind.
//!
//! ```text
//! ┌──────────┬─────────────────┐
//! │ Kind     │ Body            │
//! │ uint16 BE│ remaining bytes │
//! └──────────┴─────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::wire_format::PAYLOAD_KIND_SIZE;
use crate::codec::{MsgPackCodec, PayloadCodec};
use crate::error::{Result, TransportError};

/// Reserved kind for "no handler / handler failed" responses.
pub const UNSUPPORTED_KIND: u16 = 0xFFFF;

/// A tagged, opaque application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    kind: u16,
    body: Bytes,
}

impl Payload {
    /// Create a payload from a kind and raw body.
    pub fn new(kind: u16, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Create a payload with an empty body.
    pub fn empty(kind: u16) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Serialize `value` with the default MsgPack codec.
    pub fn encode<T: Serialize>(kind: u16, value: &T) -> Result<Self> {
        Self::encode_with::<MsgPackCodec, T>(kind, value)
    }

    /// Serialize `value` with a specific codec.
    pub fn encode_with<C: PayloadCodec, T: Serialize>(kind: u16, value: &T) -> Result<Self> {
        Ok(Self::new(kind, C::encode(value)?))
    }

    /// Deserialize the body with the default MsgPack codec.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.decode_with::<MsgPackCodec, T>()
    }

    /// Deserialize the body with a specific codec.
    pub fn decode_with<C: PayloadCodec, T: DeserializeOwned>(&self) -> Result<T> {
        C::decode(&self.body)
    }

    /// Build the well-known "unsupported" answer.
    pub fn unsupported(reason: &str) -> Self {
        Self::new(UNSUPPORTED_KIND, Bytes::copy_from_slice(reason.as_bytes()))
    }

    /// Check whether this is an "unsupported" answer.
    #[inline]
    pub fn is_unsupported(&self) -> bool {
        self.kind == UNSUPPORTED_KIND
    }

    /// Reason text of an "unsupported" answer.
    pub fn unsupported_reason(&self) -> Option<String> {
        self.is_unsupported()
            .then(|| String::from_utf8_lossy(&self.body).into_owned())
    }

    /// Payload kind discriminator.
    #[inline]
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// Body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as `Bytes` (cheap clone).
    #[inline]
    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Length on the wire (kind prefix + body).
    #[inline]
    pub fn encoded_len(&self) -> usize {
        PAYLOAD_KIND_SIZE + self.body.len()
    }

    /// Append the envelope to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.kind);
        buf.put_slice(&self.body);
    }

    /// Parse an envelope out of a frame body.
    pub fn parse(mut body: Bytes) -> Result<Self> {
        if body.len() < PAYLOAD_KIND_SIZE {
            return Err(TransportError::MalformedFrame(
                "payload shorter than kind prefix".to_string(),
            ));
        }
        let prefix = body.split_to(PAYLOAD_KIND_SIZE);
        Ok(Self {
            kind: u16::from_be_bytes([prefix[0], prefix[1]]),
            body,
        })
    }
}
