//! Block operations and the in-memory block store.
//!
//! `BlockOps` is the engine's doorway to remote storage: fetch, encoded
//! size lookup, readying (encode and assign a permanent ID), bulk upload of
//! a staged put set, and cleanup of blocks from failed publications.

use crate::cache::{Prefetcher, RecordingPrefetcher};
use crate::codec::Codec;
use crate::crypto::BlockCrypto;
use crate::put::{BlockPutState, ReadyBlockData};
use asupersync::Cx;
use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockId, BlockPointer, BlockShape, FolderMetadata, RefNonce, TlfId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// When a stale block from a failed sync attempt should be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeleteType {
    /// Remove it now; the successful revision has the same merge status.
    Always,
    /// Remove it only if the metadata put it belonged to ultimately failed.
    OnMetadataPutFailure,
}

/// Block server operations consumed by the engine.
pub trait BlockOps: Send + Sync {
    /// Fetch and decode a block.
    fn get(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        ptr: BlockPointer,
        shape: BlockShape,
    ) -> Result<Block>;

    /// Size of the encoded block without decoding it.
    fn get_encoded_size(&self, cx: &Cx, md: &FolderMetadata, ptr: BlockPointer) -> Result<u32>;

    /// Encode a block and derive its permanent ID.  Returns the ID, the
    /// plaintext size, and the upload-ready bytes.
    fn ready(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        block: &Block,
    ) -> Result<(BlockId, usize, ReadyBlockData)>;

    /// Upload every staged block in `bps`.
    fn put_blocks(&self, cx: &Cx, tlf: TlfId, bps: &BlockPutState) -> Result<()>;

    /// Remove or conditionally retire blocks left over from a failed sync.
    fn clean_up_block_state(
        &self,
        cx: &Cx,
        tlf: TlfId,
        ptrs: &[BlockPointer],
        delete_type: BlockDeleteType,
    ) -> Result<()>;

    fn prefetcher(&self) -> Arc<dyn Prefetcher>;
}

#[derive(Default)]
struct ServerState {
    blocks: HashMap<BlockId, Vec<u8>>,
    refs: HashMap<BlockId, HashSet<RefNonce>>,
    /// Pointers queued for deletion should their metadata put fail.
    md_fail_deletes: Vec<BlockPointer>,
    deleted: Vec<BlockId>,
}

/// In-memory block store standing in for the remote service.
#[derive(Default)]
pub struct BlockStoreServer {
    state: Mutex<ServerState>,
}

impl BlockStoreServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: BlockId, nonce: RefNonce, buf: Vec<u8>) {
        let mut state = self.state.lock();
        state.blocks.insert(id, buf);
        state.refs.entry(id).or_default().insert(nonce);
    }

    pub fn get(&self, id: BlockId) -> Result<Vec<u8>> {
        self.state
            .lock()
            .blocks
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::BlockNotFound { id: id.to_string() })
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.state.lock().blocks.contains_key(&id)
    }

    pub fn delete(&self, id: BlockId) {
        let mut state = self.state.lock();
        state.blocks.remove(&id);
        state.refs.remove(&id);
        state.deleted.push(id);
    }

    /// Drop one reference; the block itself goes away with its last ref.
    pub fn del_ref(&self, id: BlockId, nonce: RefNonce) {
        let mut state = self.state.lock();
        let emptied = match state.refs.get_mut(&id) {
            Some(nonces) => {
                nonces.remove(&nonce);
                nonces.is_empty()
            }
            None => true,
        };
        if emptied {
            state.blocks.remove(&id);
            state.refs.remove(&id);
            state.deleted.push(id);
        }
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// IDs deleted so far, for test assertions.
    #[must_use]
    pub fn deleted_ids(&self) -> Vec<BlockId> {
        self.state.lock().deleted.clone()
    }

    /// Pointers registered for delete-on-metadata-put-failure.
    #[must_use]
    pub fn md_fail_deletes(&self) -> Vec<BlockPointer> {
        self.state.lock().md_fail_deletes.clone()
    }
}

/// `BlockOps` over the in-memory server.
pub struct BlockOpsStandard {
    server: Arc<BlockStoreServer>,
    codec: Codec,
    crypto: BlockCrypto,
    prefetcher: Arc<RecordingPrefetcher>,
}

impl BlockOpsStandard {
    #[must_use]
    pub fn new(server: Arc<BlockStoreServer>) -> Self {
        Self {
            server,
            codec: Codec,
            crypto: BlockCrypto,
            prefetcher: Arc::new(RecordingPrefetcher::new()),
        }
    }

    #[must_use]
    pub fn server(&self) -> &Arc<BlockStoreServer> {
        &self.server
    }

    #[must_use]
    pub fn recording_prefetcher(&self) -> &Arc<RecordingPrefetcher> {
        &self.prefetcher
    }

    fn plain_size(block: &Block) -> usize {
        match block {
            Block::File(fb) => {
                if fb.is_indirect {
                    fb.iptrs.len() * std::mem::size_of::<u64>()
                } else {
                    fb.contents.len()
                }
            }
            Block::Dir(db) => db.children.len() + db.iptrs.len(),
            Block::Common(_) => 0,
        }
    }
}

impl BlockOps for BlockOpsStandard {
    fn get(
        &self,
        cx: &Cx,
        _md: &FolderMetadata,
        ptr: BlockPointer,
        _shape: BlockShape,
    ) -> Result<Block> {
        cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
        let buf = self.server.get(ptr.id)?;
        trace!(event = "block_fetch", ptr = %ptr, bytes = buf.len());
        self.codec.decode(&buf)
    }

    fn get_encoded_size(&self, cx: &Cx, _md: &FolderMetadata, ptr: BlockPointer) -> Result<u32> {
        cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
        let buf = self.server.get(ptr.id)?;
        Ok(u32::try_from(buf.len()).unwrap_or(u32::MAX))
    }

    fn ready(
        &self,
        cx: &Cx,
        _md: &FolderMetadata,
        block: &Block,
    ) -> Result<(BlockId, usize, ReadyBlockData)> {
        cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
        let buf = self.codec.encode(block)?;
        let id = self.crypto.permanent_id(&buf);
        Ok((id, Self::plain_size(block), ReadyBlockData { buf }))
    }

    fn put_blocks(&self, cx: &Cx, tlf: TlfId, bps: &BlockPutState) -> Result<()> {
        for bs in &bps.block_states {
            cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
            self.server
                .put(bs.ptr.id, bs.ptr.ref_nonce, bs.ready.buf.clone());
        }
        debug!(event = "blocks_put", tlf = %tlf, count = bps.len());
        Ok(())
    }

    fn clean_up_block_state(
        &self,
        cx: &Cx,
        tlf: TlfId,
        ptrs: &[BlockPointer],
        delete_type: BlockDeleteType,
    ) -> Result<()> {
        cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
        match delete_type {
            BlockDeleteType::Always => {
                for ptr in ptrs {
                    debug!(event = "stale_block_delete", tlf = %tlf, ptr = %ptr);
                    self.server.del_ref(ptr.id, ptr.ref_nonce);
                }
            }
            BlockDeleteType::OnMetadataPutFailure => {
                let mut state = self.server.state.lock();
                state.md_fail_deletes.extend_from_slice(ptrs);
            }
        }
        Ok(())
    }

    fn prefetcher(&self) -> Arc<dyn Prefetcher> {
        Arc::clone(&self.prefetcher) as Arc<dyn Prefetcher>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::{DataVer, FileBlock, KeyGen};

    fn ops() -> BlockOpsStandard {
        BlockOpsStandard::new(Arc::new(BlockStoreServer::new()))
    }

    fn ptr_for(id: BlockId) -> BlockPointer {
        BlockPointer {
            id,
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            ..BlockPointer::default()
        }
    }

    #[test]
    fn ready_then_put_then_get_round_trips() {
        let cx = Cx::for_testing();
        let ops = ops();
        let md = FolderMetadata::default();
        let block = Block::File(FileBlock::new_direct(b"payload".to_vec()));

        let (id, plain, ready) = ops.ready(&cx, &md, &block).unwrap();
        assert_eq!(plain, 7);

        let mut bps = BlockPutState::new();
        bps.add_new_block(ptr_for(id), block.clone(), ready);
        ops.put_blocks(&cx, TlfId(1), &bps).unwrap();

        let fetched = ops
            .get(&cx, &md, ptr_for(id), BlockShape::File)
            .unwrap();
        assert_eq!(fetched, block);
        assert!(ops.get_encoded_size(&cx, &md, ptr_for(id)).unwrap() > 0);
    }

    #[test]
    fn missing_block_reports_not_found() {
        let cx = Cx::for_testing();
        let ops = ops();
        let md = FolderMetadata::default();
        let err = ops
            .get(&cx, &md, ptr_for(BlockId([9; 32])), BlockShape::File)
            .unwrap_err();
        assert!(err.is_recoverable_for_removal());
        assert!(matches!(err, EngineError::BlockNotFound { .. }));
    }

    #[test]
    fn ready_ids_are_content_addressed() {
        let cx = Cx::for_testing();
        let ops = ops();
        let md = FolderMetadata::default();
        let a = Block::File(FileBlock::new_direct(b"same".to_vec()));
        let b = Block::File(FileBlock::new_direct(b"same".to_vec()));
        let (id_a, _, _) = ops.ready(&cx, &md, &a).unwrap();
        let (id_b, _, _) = ops.ready(&cx, &md, &b).unwrap();
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn cleanup_immediate_vs_conditional() {
        let cx = Cx::for_testing();
        let ops = ops();
        let md = FolderMetadata::default();
        let block = Block::File(FileBlock::new_direct(b"x".to_vec()));
        let (id, _, ready) = ops.ready(&cx, &md, &block).unwrap();
        let ptr = ptr_for(id);
        let mut bps = BlockPutState::new();
        bps.add_new_block(ptr, block, ready);
        ops.put_blocks(&cx, TlfId(1), &bps).unwrap();

        ops.clean_up_block_state(&cx, TlfId(1), &[ptr], BlockDeleteType::OnMetadataPutFailure)
            .unwrap();
        assert!(ops.server().contains(id));
        assert_eq!(ops.server().md_fail_deletes(), vec![ptr]);

        ops.clean_up_block_state(&cx, TlfId(1), &[ptr], BlockDeleteType::Always)
            .unwrap();
        assert!(!ops.server().contains(id));
        assert_eq!(ops.server().deleted_ids(), vec![id]);
    }
}
