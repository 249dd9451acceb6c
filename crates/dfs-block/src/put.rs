//! Staged block puts.
//!
//! The set of readied ciphertext blocks awaiting upload during a sync.

use dfs_types::{Block, BlockPointer};
use serde::{Deserialize, Serialize};

/// Encoded block bytes ready for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadyBlockData {
    pub buf: Vec<u8>,
}

impl ReadyBlockData {
    #[must_use]
    pub fn encoded_size(&self) -> u32 {
        u32::try_from(self.buf.len()).unwrap_or(u32::MAX)
    }
}

/// One staged block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub ptr: BlockPointer,
    pub block: Block,
    pub ready: ReadyBlockData,
}

/// The staged set of blocks for one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockPutState {
    pub block_states: Vec<BlockState>,
}

impl BlockPutState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            block_states: Vec::with_capacity(capacity),
        }
    }

    pub fn add_new_block(&mut self, ptr: BlockPointer, block: Block, ready: ReadyBlockData) {
        self.block_states.push(BlockState { ptr, block, ready });
    }

    #[must_use]
    pub fn ptrs(&self) -> Vec<BlockPointer> {
        self.block_states.iter().map(|bs| bs.ptr).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.block_states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block_states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::FileBlock;

    #[test]
    fn tracks_staged_blocks() {
        let mut bps = BlockPutState::new();
        assert!(bps.is_empty());
        let ptr = BlockPointer::default();
        bps.add_new_block(
            ptr,
            Block::File(FileBlock::new_direct(b"x".to_vec())),
            ReadyBlockData { buf: vec![1, 2, 3] },
        );
        assert_eq!(bps.len(), 1);
        assert_eq!(bps.ptrs(), vec![ptr]);
        assert_eq!(bps.block_states[0].ready.encoded_size(), 3);
    }
}
