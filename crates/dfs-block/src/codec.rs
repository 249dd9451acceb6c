//! Serialize-based codec.
//!
//! Deep copies travel through the codec so that copies are structurally
//! independent of their source, the same guarantee the wire encoding gives.

use dfs_error::{EngineError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encoder/decoder used for block ciphertext envelopes and deep copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| EngineError::Codec(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))
    }

    /// Copy a value by encoding and decoding it.
    pub fn deep_copy<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<T> {
        self.decode(&self.encode(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::{Block, FileBlock};

    #[test]
    fn deep_copy_is_independent() {
        let codec = Codec;
        let block = Block::File(FileBlock::new_direct(b"data".to_vec()));
        let copy = codec.deep_copy(&block).unwrap();
        assert_eq!(copy, block);
    }

    #[test]
    fn decode_rejects_garbage() {
        let codec = Codec;
        let err = codec.decode::<Block>(b"not json").unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
    }
}
