//! JSON codec using `serde_json`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PayloadCodec;
use crate::error::Result;

/// JSON codec for human-readable payloads.
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    #[inline]
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_encode_decode_map() {
        let mut map = BTreeMap::new();
        map.insert("agentId".to_string(), "web-01".to_string());

        let encoded = JsonCodec::encode(&map).unwrap();
        assert_eq!(encoded, br#"{"agentId":"web-01"}"#);

        let decoded: BTreeMap<String, String> = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<u32> = JsonCodec::decode(b"{not json");
        assert!(result.is_err());
    }
}
