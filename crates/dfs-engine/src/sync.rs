//! Three-phase sync engine: start, caller-driven block put, then finish
//! or cleanup.
//!
//! `start_sync` readies dirty blocks under the write lock and stages them
//! for upload; the caller uploads the put set and commits metadata out of
//! band; `finish_sync` settles the dirty registries on success, while
//! `cleanup_sync_state` reverts to the saved pre-sync state on a
//! recoverable error or drops the file's in-flight state on a fatal one.

use crate::dirty_file::SyncFailure;
use crate::file_data::ready_file_block;
use crate::state::LockedState;
use crate::{FolderBlocks, LockState, Node};
use asupersync::Cx;
use dfs_block::{BlockCache, BlockCrypto, BlockDeleteType, BlockOps, BlockPutState, Codec,
                LocalBlockCache, ReadyBlockData};
use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockContext, BlockDirectType, BlockInfo, BlockPointer, BlockRef,
                BlockUsage, DirEntry, FileBlock, FolderMetadata, FolderOp, FolderPath, RefNonce,
                SyncOp, TlfId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

/// A failed publication whose staged blocks may need deletion once a
/// later attempt commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MdToCleanIfUnused {
    pub md: FolderMetadata,
    pub bps: BlockPutState,
}

/// Per-file accumulation of unsynced state between publications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SyncInfo {
    pub old_info: BlockInfo,
    pub op: SyncOp,
    pub unrefs: Vec<BlockInfo>,
    pub bps: Option<BlockPutState>,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
    pub to_clean_if_unused: Vec<MdToCleanIfUnused>,
}

impl SyncInfo {
    pub fn new(de: &DirEntry) -> Self {
        Self {
            old_info: de.info,
            op: SyncOp::new(de.info.ptr),
            unrefs: Vec::new(),
            bps: None,
            ref_bytes: 0,
            unref_bytes: 0,
            to_clean_if_unused: Vec::new(),
        }
    }

    /// Structurally independent copy, via the codec.
    pub fn deep_copy(&self, codec: &Codec) -> Result<Self> {
        codec.deep_copy(self)
    }

    /// A readied block replaced `ptr`, which was itself a ref from a
    /// prior failed attempt; drop it from the refs and pending unrefs.
    pub fn remove_replaced_block(&mut self, ptr: BlockPointer) {
        if let Some(idx) = self.op.refs.iter().position(|p| *p == ptr) {
            debug!(event = "replacing_old_ref", ptr = %ptr);
            self.op.refs.remove(idx);
            self.unrefs.retain(|u| u.ptr != ptr);
        }
    }
}

/// State carried across one file's sync attempt.
pub struct FileSyncState {
    pub(crate) file_ref: BlockRef,
    pub(crate) saved_si: Option<SyncInfo>,
    pub(crate) saved_fblock: Option<FileBlock>,
    /// New permanent pointer to the old pointer it superseded; used to
    /// re-dirty children if the sync reverts.
    pub(crate) redirty_on_recoverable: HashMap<BlockPointer, BlockPointer>,
    /// Transient dirty-cache entries to drop when the sync finishes.
    pub(crate) old_file_block_ptrs: Vec<BlockPointer>,
    /// Permanent clean-cache entries to drop once blocks reach the store.
    pub(crate) new_indirect_file_block_ptrs: Vec<BlockPointer>,
}

/// Everything `start_sync` hands back to the caller driving the upload.
pub struct StartSyncResult {
    /// The readied top block, with children under permanent IDs.
    pub fblock: FileBlock,
    /// Staged ciphertext blocks awaiting upload.
    pub bps: BlockPutState,
    /// The file's parent entry captured under the lock, so later writes
    /// cannot slip between capture and metadata commit.
    pub dirty_de: DirEntry,
    pub sync_state: FileSyncState,
}

impl FolderBlocks {
    /// Phase one: collapse the accumulated op, ready all dirty children,
    /// and stage the put set.  Must be paired with `cleanup_sync_state`
    /// on every exit and `finish_sync` on success.
    pub fn start_sync(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &mut FolderMetadata,
        file: &FolderPath,
    ) -> Result<StartSyncResult> {
        if let Some(journal) = &self.config.journal {
            journal.dirty_op_start(self.id());
        }
        let mut wg = self.lock.write(ls);
        let st: &mut LockedState = &mut wg;
        let tail = file.tail_pointer();
        let file_ref = file.tail_ref();
        let charged_to = self.charged_to(cx)?;

        let (fblock0, _) = self.get_file_block_no_unlock(cx, md, tail, file)?;

        let mut sync_state = FileSyncState {
            file_ref,
            saved_si: None,
            saved_fblock: None,
            redirty_on_recoverable: HashMap::new(),
            old_file_block_ptrs: Vec::new(),
            new_indirect_file_block_ptrs: Vec::new(),
        };

        {
            let Some(si) = st.unref_cache.get_mut(&file_ref) else {
                return Err(EngineError::NoSyncOp {
                    reference: file_ref.to_string(),
                });
            };
            // Collapse the write range to shrink the op, then hand an
            // independent copy to the metadata: local writes must keep
            // accruing here while that copy travels with the revision.
            si.op.collapse_writes();
            si.op.set_final_path(file.clone());
            md.add_op(FolderOp::Sync(si.op.clone()));

            if fblock0.is_indirect {
                sync_state.saved_fblock = Some(fblock0.clone());
            }
            sync_state.saved_si = Some(si.deep_copy(&self.config.codec)?);

            if si.bps.is_none() {
                si.bps = Some(BlockPutState::new());
            } else {
                // A retried sync reinstates the previous attempt's quota
                // accounting and remembers its staged refs.
                md.set_ref_bytes(si.ref_bytes);
                md.add_disk_usage(si.ref_bytes);
                md.set_unref_bytes(si.unref_bytes);
                md.set_disk_usage(md.disk_usage().saturating_sub(si.unref_bytes));
                sync_state
                    .new_indirect_file_block_ptrs
                    .extend(si.op.refs.iter().copied());
            }
        }

        let tlf = self.id();
        let branch = self.branch().clone();
        let dirty_bcache = std::sync::Arc::clone(&self.config.dirty_bcache);
        let is_dirty = move |p: BlockPointer| dirty_bcache.is_dirty(tlf, p, &branch);

        // Resplit children along fresh boundaries; preserve any unrefs
        // before checking the error.
        let mut split_unrefs = Vec::new();
        let split_result = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            fd.split(cx, &is_dirty, &mut split_unrefs)
        };
        for unref in &split_unrefs {
            md.add_unref_block(*unref);
            if let Some(si) = st.unref_cache.get_mut(&file_ref) {
                si.op.add_unref_block(unref.ptr);
            }
        }
        split_result?;

        // Ready all dirty children, staging ciphertext into the put set.
        let mut bps = st
            .unref_cache
            .get_mut(&file_ref)
            .and_then(|si| si.bps.take())
            .unwrap_or_default();
        let ready_result = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            fd.ready(
                cx,
                tlf,
                md,
                self.config.block_cache.as_ref(),
                self.config.block_ops.as_ref(),
                &mut bps,
                &is_dirty,
            )
        };
        let new_to_old = match ready_result {
            Ok(map) => map,
            Err(err) => {
                if let Some(si) = st.unref_cache.get_mut(&file_ref) {
                    si.bps = Some(bps);
                }
                return Err(err);
            }
        };

        {
            let LockedState {
                dirty_files,
                unref_cache,
                ..
            } = st;
            let df = dirty_files
                .get_mut(&tail)
                .ok_or_else(|| EngineError::NoSyncOp {
                    reference: file_ref.to_string(),
                })?;
            let si = unref_cache
                .get_mut(&file_ref)
                .ok_or_else(|| EngineError::NoSyncOp {
                    reference: file_ref.to_string(),
                })?;
            for (new_info, old_ptr) in &new_to_old {
                sync_state
                    .new_indirect_file_block_ptrs
                    .push(new_info.ptr);
                // Defer deleting the old dirty entry until the new path
                // is ready, so concurrent reads still see the file.
                sync_state.old_file_block_ptrs.push(*old_ptr);
                md.add_ref_block(*new_info);
                si.op.add_ref_block(new_info.ptr);
                si.remove_replaced_block(*old_ptr);
                if let Some(FolderOp::Sync(op)) = md.ops.last_mut() {
                    op.refs.retain(|p| *p != *old_ptr);
                }
                df.set_block_syncing(*old_ptr)?;
                df.set_block_orphaned(*old_ptr, true);
                sync_state
                    .redirty_on_recoverable
                    .insert(new_info.ptr, *old_ptr);
            }
            df.set_block_syncing(tail)?;
            sync_state.old_file_block_ptrs.push(tail);
            si.bps = Some(bps);
        }

        // Capture the parent entry before the lock is released, so
        // subsequent writes cannot slip between capture and commit.
        let parent = file.parent_path();
        let mut dirty_de = {
            let mut dd = self.dir_data_write(md, &parent, charged_to);
            dd.lookup(cx, file.tail_name())?
        };

        let bps_out;
        {
            let LockedState {
                dirty_files,
                unref_cache,
                ..
            } = st;
            let si = unref_cache
                .get_mut(&file_ref)
                .ok_or_else(|| EngineError::NoSyncOp {
                    reference: file_ref.to_string(),
                })?;
            // Merge the accumulated unrefs into the revision, and stamp
            // the dirty entry with the pre-write encoded size.
            for info in si.unrefs.clone() {
                md.add_unref_block(info);
                si.op.add_unref_block(info.ptr);
            }
            dirty_de.info.encoded_size = si.old_info.encoded_size;

            // Swap in an independent copy of the op: the one recorded in
            // the metadata must not see future local writes.
            si.op = self.config.codec.deep_copy(&si.op)?;
            si.ref_bytes = md.ref_bytes();
            si.unref_bytes = md.unref_bytes();
            bps_out = si.bps.clone().unwrap_or_default();

            if let Some(df) = dirty_files.get_mut(&tail) {
                // Deferred extension bytes ride along with this attempt.
                df.assimilate_deferred_new_bytes();
            }
        }

        let (fblock, _) = self.get_file_block_no_unlock(cx, md, tail, file)?;
        debug!(
            event = "sync_started",
            file = %tail,
            staged_blocks = bps_out.len()
        );
        Ok(StartSyncResult {
            fblock,
            bps: bps_out,
            dirty_de,
            sync_state,
        })
    }

    /// Write the synced file's entry into its parent directory through a
    /// scratch cache, leaving the live dirty cache untouched.
    pub fn merge_dirty_entry_with_scratch(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
        lbc: &mut LocalBlockCache,
        dirty_de: DirEntry,
    ) -> Result<()> {
        let charged_to = self.charged_to(cx)?;
        let mut rg = self.lock.read(ls);
        let parent = file.parent_path();
        let unrefs = {
            let mut dd = crate::dir_data::DirData::new(
                parent.clone(),
                charged_to,
                md.key_gen,
                self.config.splitter.as_ref(),
                &self.config.crypto,
                crate::sources::ScratchDirSource {
                    eng: self,
                    rg: &mut rg,
                    md,
                    dir: &parent,
                    lbc,
                },
            );
            dd.set_entry(cx, file.tail_name(), dirty_de)?
        };
        if !unrefs.is_empty() {
            return Err(EngineError::BlockStore(format!(
                "merging a dirty entry produced {} new unrefs",
                unrefs.len()
            )));
        }
        Ok(())
    }

    /// Phase three, success: apply the op's pointer updates, drop stale
    /// dirty and clean cache entries, replay deferred writes against the
    /// new path, and clean up blocks from prior failed attempts.  Returns
    /// the affected nodes and whether deferred writes left the file
    /// dirty.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_sync(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        op: &FolderOp,
        old_path: &FolderPath,
        new_path: &FolderPath,
        sync_state: &FileSyncState,
    ) -> Result<(Vec<Node>, bool)> {
        let mut wg = self.lock.write(ls);
        let st: &mut LockedState = &mut wg;

        let mut affected = Vec::new();
        for update in op.all_updates() {
            if let Some(node) = self.update_pointer_locked(update.old_ptr, update.new_ptr, true) {
                affected.push(node);
            }
        }

        for ptr in &sync_state.old_file_block_ptrs {
            trace!(event = "deleting_synced_dirty_ptr", ptr = %ptr);
            self.config
                .dirty_bcache
                .delete(self.id(), *ptr, self.branch())?;
        }
        for ptr in &sync_state.new_indirect_file_block_ptrs {
            if let Err(err) = self.config.block_cache.delete_permanent(ptr.id) {
                warn!(event = "permanent_cache_delete_failed", id = %ptr.id, error = %err);
            }
        }

        let still_dirty = self.do_deferred_writes_locked(cx, st, md, old_path, new_path)?;

        // All sync state for the old path can go: any concurrent write
        // was deferred and has just been replayed.
        let to_clean = st
            .unref_cache
            .get(&old_path.tail_ref())
            .map(|si| si.to_clean_if_unused.clone())
            .unwrap_or_default();
        self.clear_cache_info_locked(st, old_path)?;
        self.clean_up_unused_blocks(cx, md, &to_clean)?;

        debug!(event = "sync_finished", file = %old_path.tail_pointer(), still_dirty);
        Ok((affected, still_dirty))
    }

    /// Remove blocks staged by prior failed attempts, unless the
    /// committed revision references them.  The same block across
    /// multiple entries is handled once, under the precedence of the
    /// divergent-merge-status entry (always earliest in the list).
    fn clean_up_unused_blocks(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        to_clean: &[MdToCleanIfUnused],
    ) -> Result<()> {
        if to_clean.is_empty() {
            return Ok(());
        }
        let refs: HashSet<BlockPointer> = md
            .all_referenced_ptrs()
            .into_iter()
            .filter(|p| p.is_initialized())
            .collect();

        let mut blocks_seen: HashSet<BlockPointer> = HashSet::new();
        for old in to_clean {
            let delete_type = if old.md.merged == md.merged {
                BlockDeleteType::Always
            } else {
                BlockDeleteType::OnMetadataPutFailure
            };
            let mut failed = Vec::new();
            for ptr in old.bps.ptrs() {
                debug_assert!(ptr.is_initialized(), "staged put set holds a null pointer");
                if !blocks_seen.insert(ptr) {
                    continue;
                }
                if refs.contains(&ptr) && delete_type == BlockDeleteType::Always {
                    continue;
                }
                debug!(
                    event = "cleaning_failed_attempt_block",
                    ptr = %ptr,
                    revision = old.md.revision,
                    ?delete_type
                );
                failed.push(ptr);
            }
            if !failed.is_empty() {
                self.config
                    .block_ops
                    .clean_up_block_state(cx, self.id(), &failed, delete_type)?;
            }
        }
        Ok(())
    }

    /// Phase three, failure: always invoked (success passes no error and
    /// is a no-op).  Recoverable errors revert to the saved pre-sync
    /// state so the sync can retry; unrecoverable ones drop the file's
    /// in-flight state and queue its staged blocks for future cleanup.
    pub fn cleanup_sync_state(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
        blocks_to_remove: &[BlockPointer],
        sync_state: &FileSyncState,
        err: Option<&EngineError>,
    ) {
        if let Some(journal) = &self.config.journal {
            journal.dirty_op_end(self.id());
        }
        let Some(err) = err else {
            return;
        };
        let mut wg = self.lock.write(ls);
        let st: &mut LockedState = &mut wg;
        let tail = file.tail_pointer();

        // Blocked writers learn about the failure before the dirty state
        // resets; recoverable failures retry transparently instead.
        if !err.is_recoverable_block_error() {
            if let Some(df) = st.dirty_files.get_mut(&tail) {
                df.notify_err_listeners(&SyncFailure::from_error(err));
            }
        }

        if let Some(si) = st.unref_cache.get_mut(&sync_state.file_ref) {
            // The op may be reused by a later attempt.
            si.op.reset_update_state();
            si.to_clean_if_unused.push(MdToCleanIfUnused {
                md: md.clone(),
                bps: si.bps.clone().unwrap_or_default(),
            });
        }

        if err.is_recoverable_block_error() {
            self.revert_sync_info_after_recoverable_error(st, blocks_to_remove, sync_state);
            if let Some(saved) = &sync_state.saved_fblock {
                self.fix_child_blocks_after_recoverable_error(
                    cx,
                    st,
                    md,
                    file,
                    &sync_state.redirty_on_recoverable,
                    saved,
                );
            }
        } else {
            // The deferred bytes are already accounted for in the
            // still-dirty blocks.
            let wait_bytes = st
                .deferred
                .get(&file.tail_ref())
                .map_or(0, |ds| ds.wait_bytes);
            if let Some(df) = st.dirty_files.get_mut(&tail) {
                df.update_not_yet_syncing_bytes(-wait_bytes);
                for ptr in &sync_state.old_file_block_ptrs {
                    if df.is_block_orphaned(*ptr) {
                        debug!(event = "deleting_dirty_orphan", ptr = %ptr);
                        if let Err(del_err) =
                            self.config.dirty_bcache.delete(self.id(), *ptr, self.branch())
                        {
                            debug!(event = "orphan_delete_failed", ptr = %ptr, error = %del_err);
                        }
                    }
                }
            }
            st.deferred.remove(&file.tail_ref());
        }

        // Whatever was in flight is now merely dirty again.
        if let Some(df) = st.dirty_files.get_mut(&tail) {
            df.reset_syncing_blocks_to_dirty();
        }
    }

    /// Reset the sync info to the pre-sync snapshot, keeping the cleanup
    /// queue, carrying forward unrefs that do not belong to blocks this
    /// attempt created, and dropping staged states for bad pointers.
    fn revert_sync_info_after_recoverable_error(
        &self,
        st: &mut LockedState,
        blocks_to_remove: &[BlockPointer],
        sync_state: &FileSyncState,
    ) {
        let Some(saved) = &sync_state.saved_si else {
            return;
        };
        let Some(si) = st.unref_cache.get_mut(&sync_state.file_ref) else {
            return;
        };
        let to_clean = std::mem::take(&mut si.to_clean_if_unused);
        let new_indirect: HashSet<BlockPointer> = sync_state
            .new_indirect_file_block_ptrs
            .iter()
            .copied()
            .collect();
        let mut unrefs = Vec::with_capacity(si.unrefs.len());
        for unref in &si.unrefs {
            if new_indirect.contains(&unref.ptr) {
                debug!(event = "dropping_unref", ptr = %unref.ptr);
                continue;
            }
            unrefs.push(*unref);
        }

        *si = saved.clone();
        si.to_clean_if_unused = to_clean;
        si.unrefs = unrefs;
        if let Some(bps) = &mut si.bps {
            let remove: HashSet<BlockPointer> = blocks_to_remove.iter().copied().collect();
            bps.block_states.retain(|bs| !remove.contains(&bs.ptr));
        }
    }

    /// After a recoverable failure on a multi-block file, un-orphan the
    /// old children and re-dirty the readied blocks under their new
    /// permanent IDs, so a retried sync knows they still need to go out.
    /// When the dirty top no longer carries any readied pointer, the
    /// saved pre-sync top replaces it instead.
    fn fix_child_blocks_after_recoverable_error(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        file: &FolderPath,
        redirty: &HashMap<BlockPointer, BlockPointer>,
        saved_fblock: &FileBlock,
    ) {
        let tail = file.tail_pointer();
        if let Some(df) = st.dirty_files.get_mut(&tail) {
            for old_ptr in redirty.values() {
                debug!(event = "un_orphaning", ptr = %old_ptr);
                df.set_block_orphaned(*old_ptr, false);
            }
        }

        let charged_to = match self.charged_to(cx) {
            Ok(user) => user,
            Err(err) => {
                warn!(event = "recovery_identity_lookup_failed", error = %err);
                st.do_defer_write = false;
                return;
            }
        };

        let new_ptrs: HashSet<BlockPointer> = redirty.keys().copied().collect();
        let found = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            match fd.find_iptrs_and_clear_size(cx, &new_ptrs) {
                Ok(found) => found,
                Err(err) => {
                    warn!(event = "recovery_iptr_walk_failed", error = %err);
                    st.do_defer_write = false;
                    return;
                }
            }
        };

        if found.is_empty() {
            // The readied pointers are gone from the top already; fall
            // back to the pre-sync snapshot.
            if let Err(put_err) = self.config.dirty_bcache.put(
                self.id(),
                tail,
                self.branch(),
                Block::File(saved_fblock.clone()),
            ) {
                warn!(event = "saved_top_restore_failed", error = %put_err);
            }
            st.do_defer_write = false;
            return;
        }

        for (new_ptr, old_ptr) in redirty {
            if !found.contains(new_ptr) {
                continue;
            }
            debug!(event = "re_dirtying_block", new = %new_ptr, old = %old_ptr);
            // These blocks were readied, so they are in the clean cache
            // under their permanent IDs.
            let block = match self.config.block_cache.get(*new_ptr) {
                Ok(Block::File(fb)) => fb,
                Ok(_) | Err(_) => {
                    warn!(event = "re_dirty_fetch_failed", ptr = %new_ptr);
                    continue;
                }
            };
            if let Err(err) = self.cache_file_block_locked(st, *new_ptr, file, &block) {
                warn!(event = "re_dirty_cache_failed", ptr = %new_ptr, error = %err);
            }
            if let Err(err) = self
                .config
                .dirty_bcache
                .delete(self.id(), *old_ptr, self.branch())
            {
                debug!(event = "old_dirty_delete_failed", ptr = %old_ptr, error = %err);
            }
        }

        // Re-dirtying wrote through the normal cacher, which flags
        // deferral; no sync is running anymore, so clear it.
        st.do_defer_write = false;
    }
}

/// Ready a block for upload: encode it, derive its permanent ID (deduping
/// direct file contents against the clean cache), and return the staged
/// data alongside the new block info.
#[allow(clippy::too_many_arguments)]
pub fn ready_block(
    cx: &Cx,
    tlf: TlfId,
    md: &FolderMetadata,
    bcache: &dyn BlockCache,
    block_ops: &dyn BlockOps,
    crypto: &BlockCrypto,
    block: &Block,
    charged_to: UserId,
) -> Result<(BlockInfo, usize, ReadyBlockData)> {
    if let Block::File(fb) = block {
        return ready_file_block(cx, tlf, md, bcache, block_ops, crypto, fb, charged_to);
    }
    let (id, plain_size, ready_data) = block_ops.ready(cx, md, block)?;
    let direct_type = if block.is_indirect() {
        BlockDirectType::Indirect
    } else {
        BlockDirectType::Direct
    };
    let ptr = BlockPointer {
        id,
        key_gen: md.key_gen,
        data_ver: block.data_version(),
        direct_type,
        ref_nonce: RefNonce::ZERO,
        context: BlockContext {
            creator: charged_to,
            usage: BlockUsage::Data,
        },
    };
    Ok((
        BlockInfo {
            ptr,
            encoded_size: ready_data.encoded_size(),
        },
        plain_size,
        ready_data,
    ))
}
