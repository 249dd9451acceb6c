//! Block identifier generation.
//!
//! Permanent IDs are the blake3 hash of the encoded block, so identical
//! ciphertexts collapse to one stored block.  Temporary IDs and ref-nonces
//! are random and never leave the local caches.

use dfs_types::{BlockId, RefNonce};

/// Cryptographic helpers for block identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockCrypto;

impl BlockCrypto {
    /// Content-addressed ID for an encoded block.
    #[must_use]
    pub fn permanent_id(&self, encoded: &[u8]) -> BlockId {
        BlockId(*blake3::hash(encoded).as_bytes())
    }

    /// Random ID for a block that only exists in local caches.
    #[must_use]
    pub fn temporary_id(&self) -> BlockId {
        BlockId(rand::random())
    }

    /// Random nonce distinguishing a new reference to an existing block.
    #[must_use]
    pub fn block_ref_nonce(&self) -> RefNonce {
        RefNonce(rand::random())
    }
}
