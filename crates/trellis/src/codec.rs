//! Wire message codec.
//!
//! Messages cross the transport in a self-describing byte form, JSON
//! by default with CBOR selectable per deployment.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use trellis_api::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Json,
    Cbor,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    kind: CodecKind,
}

impl Codec {
    pub fn new(kind: CodecKind) -> Self {
        Codec { kind }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.kind {
            CodecKind::Json => serde_json::to_vec(value)
                .map_err(|e| Error::SerializationFailed(e.to_string())),
            CodecKind::Cbor => {
                let mut out = Vec::new();
                ciborium::ser::into_writer(value, &mut out)
                    .map_err(|e| Error::SerializationFailed(e.to_string()))?;
                Ok(out)
            }
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self.kind {
            CodecKind::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::DeserializationFailed(e.to_string())),
            CodecKind::Cbor => ciborium::de::from_reader(bytes)
                .map_err(|e| Error::DeserializationFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_api::Connected;

    #[test]
    fn test_json_round_trip() {
        let codec = Codec::new(CodecKind::Json);
        let msg = Connected {
            device_id: "dev-1".into(),
            timestamp: Some(42),
            telemetry: None,
        };
        let bytes = codec.serialize(&msg).unwrap();
        let back: Connected = codec.deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_cbor_round_trip() {
        let codec = Codec::new(CodecKind::Cbor);
        let msg = Connected {
            device_id: "dev-1".into(),
            timestamp: None,
            telemetry: None,
        };
        let bytes = codec.serialize(&msg).unwrap();
        let back: Connected = codec.deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_deserialize_error_is_classified() {
        let codec = Codec::new(CodecKind::Json);
        let err = codec.deserialize::<Connected>(b"not json").unwrap_err();
        assert!(matches!(err, Error::DeserializationFailed(_)));
    }
}
