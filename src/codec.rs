use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Trait representing a serialization strategy for cached values.
pub trait CacheCodec: Send + Sync + Clone + 'static {
    fn encode<T>(&self, value: &T) -> Result<Bytes, CacheError>
    where
        T: Serialize + ?Sized;

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CacheError>
    where
        T: DeserializeOwned;
}

/// Default [`CacheCodec`] implementation backed by `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl CacheCodec for BincodeCodec {
    fn encode<T>(&self, value: &T) -> Result<Bytes, CacheError>
    where
        T: Serialize + ?Sized,
    {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|err| CacheError::Codec(err.to_string()))
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CacheError>
    where
        T: DeserializeOwned,
    {
        bincode::deserialize(bytes).map_err(|err| CacheError::Codec(err.to_string()))
    }
}

/// [`CacheCodec`] storing values as JSON text, readable by other clients of
/// the same store.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn encode<T>(&self, value: &T) -> Result<Bytes, CacheError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| CacheError::Codec(err.to_string()))
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CacheError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|err| CacheError::Codec(err.to_string()))
    }
}
