//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map) so that the
//! collector can tolerate added or reordered fields between agent versions.
//!
//! # Example
//!
//! ```
//! use agentlink::codec::{MsgPackCodec, PayloadCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct SpanChunk {
//!     trace_id: u64,
//!     events: Vec<String>,
//! }
//!
//! let chunk = SpanChunk { trace_id: 42, events: vec!["db.query".to_string()] };
//! let encoded = MsgPackCodec::encode(&chunk).unwrap();
//! let decoded: SpanChunk = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, chunk);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PayloadCodec;
use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl PayloadCodec for MsgPackCodec {
    /// Encode a value to MsgPack bytes in struct-as-map format.
    #[inline]
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct AgentStat {
        pid: u32,
        hostname: String,
        sampling: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = AgentStat {
            pid: 4242,
            hostname: "web-01".to_string(),
            sampling: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: AgentStat = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_decode_nested() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Annotation {
            key: u16,
            value: String,
        }

        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct SpanEvent {
            sequence: u32,
            annotations: Vec<Annotation>,
            exception: Option<String>,
        }

        let original = SpanEvent {
            sequence: 3,
            annotations: vec![Annotation {
                key: 12,
                value: "SELECT 1".to_string(),
            }],
            exception: None,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: SpanEvent = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let stat = AgentStat {
            pid: 1,
            hostname: "h".to_string(),
            sampling: false,
        };

        // fixmap (0x8X), not fixarray (0x9X)
        let encoded = MsgPackCodec::encode(&stat).unwrap();
        assert_eq!(encoded[0] & 0xF0, 0x80, "got {:02X}", encoded[0]);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<AgentStat> = MsgPackCodec::decode(b"\xc1 reserved");
        assert!(matches!(result, Err(crate::error::TransportError::MsgPackDecode(_))));
    }
}
