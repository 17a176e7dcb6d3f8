//! Conversion between job results and their stored text form.
//!
//! Persistent backends never look inside a result: they store whatever
//! string the configured [`ResultCodec`] produces and hand it back on read.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode result: {0}")]
    Encode(String),

    #[error("failed to decode result: {0}")]
    Decode(String),
}

/// Encodes results of type `T` for storage.
pub trait ResultCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<String, CodecError>;

    fn decode(&self, raw: &str) -> Result<T, CodecError>;
}

/// JSON codec for any serde type. The default for every backend.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> ResultCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<T, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Evaluation {
        fired: bool,
        value: f64,
    }

    #[test]
    fn json_codec_preserves_value() {
        let codec = JsonCodec::<Evaluation>::new();
        let value = Evaluation {
            fired: true,
            value: 12.5,
        };

        let raw = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&raw).unwrap(), value);
    }

    #[test]
    fn json_codec_rejects_malformed_payload() {
        let codec = JsonCodec::<Evaluation>::new();
        let err = codec.decode("{\"fired\": 1").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
