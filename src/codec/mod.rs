//! Codec module - serialization of application payload bodies.
//!
//! The transport treats payload bodies as opaque bytes. Typed helpers on
//! [`Payload`](crate::protocol::Payload) go through a [`PayloadCodec`]:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (default)
//! - [`JsonCodec`] - JSON using `serde_json` (debugging, handshake-like payloads)
//!
//! # Example
//!
//! ```
//! use agentlink::codec::{MsgPackCodec, PayloadCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod json;
mod msgpack;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Boundary between the transport and the domain message encoding.
///
/// Codecs are marker types with associated functions so the choice is made
/// at compile time.
pub trait PayloadCodec {
    /// Encode a value to bytes.
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>>;

    /// Decode bytes to a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}
