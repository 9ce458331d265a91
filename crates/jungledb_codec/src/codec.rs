//! Codec trait for persistent backend adapters.

use crate::decoder::from_canonical_bytes;
use crate::encoder::to_canonical_bytes;
use crate::error::CodecResult;
use crate::value::Value;

/// Converts record values to and from their stored byte form.
///
/// Persistent backend adapters use a codec to serialize records; the
/// in-memory backend stores [`Value`]s directly and never consults one.
pub trait Codec: Send + Sync {
    /// Encodes a record value for storage.
    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>>;

    /// Decodes a stored record back into a value.
    fn decode(&self, bytes: &[u8]) -> CodecResult<Value>;
}

/// The default codec: canonical binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        Ok(to_canonical_bytes(value))
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        from_canonical_bytes(bytes)
    }
}
