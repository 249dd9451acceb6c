//! Indirect-block-aware view of one file.
//!
//! All algorithms are parameterized by a block source that serves reads
//! and accepts dirtied blocks, so the same code runs against the live
//! dirty cache during writes and against a scratch cache during sync
//! staging and deep copies.
//!
//! Leaf blocks cover half-open byte ranges; an indirect block's children
//! are ordered by starting offset.  A leaf's range ends at the next
//! sibling's offset at any level, or extends unbounded for the rightmost
//! leaf.

use crate::lock::BlockReqType;
use asupersync::Cx;
use dfs_block::{BlockCache, BlockOps, BlockPutState, BlockSplitter, BlockCrypto, ReadyBlockData};
use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockContext, BlockDirectType, BlockInfo, BlockPointer, BlockUsage,
                DataVer, DirEntry, FileBlock, FolderMetadata, FolderPath, IndirectFilePtr,
                KeyGen, RefNonce, TlfId, UserId};
use std::collections::{HashMap, HashSet};
use tracing::{trace, warn};

/// Source of file blocks for a `FileData` view.
pub(crate) trait FileBlockSource {
    /// Fetch the block under `ptr`, reporting whether it was already
    /// dirty.  For `BlockReqType::Write` the returned block is an owned
    /// copy the caller may mutate freely.
    fn get_file_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        kind: BlockReqType,
    ) -> Result<(FileBlock, bool)>;

    /// Record a mutated block under `ptr`.
    fn cache_dirty(&mut self, ptr: BlockPointer, block: &FileBlock) -> Result<()>;
}

/// Mutation side effects accumulated across a write or truncate, kept
/// separate from the result so byte accounting and unrefs survive errors.
#[derive(Debug, Default)]
pub(crate) struct WriteAcc {
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
    pub newly_dirtied_child_bytes: i64,
}

impl WriteAcc {
    pub fn push_dirty(&mut self, ptr: BlockPointer) {
        if !self.dirty_ptrs.contains(&ptr) {
            self.dirty_ptrs.push(ptr);
        }
    }
}

/// One ancestor on the path from the top block down to a leaf.
pub(crate) struct ParentBlockAndChildIndex {
    pub ptr: BlockPointer,
    pub block: FileBlock,
    pub child_index: usize,
}

/// Result of locating the leaf covering an offset.
pub(crate) struct LeafLookup {
    pub ptr: BlockPointer,
    pub parents: Vec<ParentBlockAndChildIndex>,
    pub block: FileBlock,
    pub next_block_off: Option<u64>,
    pub start_off: u64,
    pub was_dirty: bool,
}

/// A file view bound to a path and a block source.
pub(crate) struct FileData<'a, S: FileBlockSource> {
    file: FolderPath,
    charged_to: UserId,
    key_gen: KeyGen,
    splitter: &'a dyn BlockSplitter,
    crypto: &'a BlockCrypto,
    source: S,
}

impl<'a, S: FileBlockSource> FileData<'a, S> {
    pub fn new(
        file: FolderPath,
        charged_to: UserId,
        key_gen: KeyGen,
        splitter: &'a dyn BlockSplitter,
        crypto: &'a BlockCrypto,
        source: S,
    ) -> Self {
        Self {
            file,
            charged_to,
            key_gen,
            splitter,
            crypto,
            source,
        }
    }

    fn tail_ptr(&self) -> BlockPointer {
        self.file.tail_pointer()
    }

    fn new_temp_ptr(&self, direct_type: BlockDirectType) -> BlockPointer {
        BlockPointer {
            id: self.crypto.temporary_id(),
            key_gen: self.key_gen,
            data_ver: DataVer::FIRST,
            direct_type,
            ref_nonce: RefNonce::ZERO,
            context: BlockContext {
                creator: self.charged_to,
                usage: BlockUsage::Data,
            },
        }
    }

    // ── Walking ─────────────────────────────────────────────────────────────

    /// Locate the leaf covering `off`, collecting the parent chain so the
    /// caller knows which indirect pointers to mark dirty.
    pub fn leaf_at_offset(
        &mut self,
        cx: &Cx,
        off: u64,
        kind: BlockReqType,
    ) -> Result<LeafLookup> {
        let tail = self.tail_ptr();
        let (mut block, mut was_dirty) = self.source.get_file_block(cx, tail, kind)?;
        let mut ptr = tail;
        let mut parents = Vec::new();
        let mut start_off = 0_u64;
        let mut next_block_off = None;
        while block.is_indirect {
            if block.iptrs.is_empty() {
                return Err(EngineError::BlockStore(format!(
                    "indirect block {ptr} has no children"
                )));
            }
            let idx = block
                .iptrs
                .partition_point(|p| p.off <= off)
                .saturating_sub(1);
            if idx + 1 < block.iptrs.len() {
                next_block_off = Some(block.iptrs[idx + 1].off);
            }
            let child_ptr = block.iptrs[idx].info.ptr;
            start_off = block.iptrs[idx].off;
            parents.push(ParentBlockAndChildIndex {
                ptr,
                block,
                child_index: idx,
            });
            let (child, child_dirty) = self.source.get_file_block(cx, child_ptr, kind)?;
            ptr = child_ptr;
            block = child;
            was_dirty = child_dirty;
        }
        Ok(LeafLookup {
            ptr,
            parents,
            block,
            next_block_off,
            start_off,
            was_dirty,
        })
    }

    // ── Reading ─────────────────────────────────────────────────────────────

    /// Read into `dest` starting at `off`, returning the bytes produced.
    /// Holes and short blocks read as zeros; the read stops at the last
    /// materialized block.
    pub fn read(&mut self, cx: &Cx, dest: &mut [u8], off: u64) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        let mut n = 0_usize;
        loop {
            let target = off + n as u64;
            let lookup = self.leaf_at_offset(cx, target, BlockReqType::Read)?;
            let in_block = usize::try_from(target - lookup.start_off).unwrap_or(usize::MAX);
            let contents = &lookup.block.contents;
            if in_block < contents.len() {
                let m = (contents.len() - in_block).min(dest.len() - n);
                dest[n..n + m].copy_from_slice(&contents[in_block..in_block + m]);
                n += m;
            }
            if n >= dest.len() {
                break;
            }
            match lookup.next_block_off {
                Some(nbo) => {
                    let target = off + n as u64;
                    if target < nbo {
                        let gap = usize::try_from(nbo - target).unwrap_or(usize::MAX);
                        let z = gap.min(dest.len() - n);
                        dest[n..n + z].fill(0);
                        n += z;
                        if n >= dest.len() {
                            break;
                        }
                    }
                }
                None => break,
            }
        }
        Ok(n)
    }

    // ── Writing ─────────────────────────────────────────────────────────────

    /// Write `data` at `off`.  Returns the updated entry and the number of
    /// bytes the file grew by; side effects accrue to `acc` even when an
    /// error interrupts the write partway.
    pub fn write(
        &mut self,
        cx: &Cx,
        data: &[u8],
        off: u64,
        de: &DirEntry,
        acc: &mut WriteAcc,
    ) -> Result<(DirEntry, u64)> {
        let mut new_de = de.clone();
        let n = data.len();
        if n == 0 {
            return Ok((new_de, 0));
        }
        let mut n_copied = 0_usize;
        let mut rounds = 0_usize;
        while n_copied < n {
            rounds += 1;
            if rounds > 2 * n + 16 {
                return Err(EngineError::BlockStore(
                    "file write failed to make progress".to_owned(),
                ));
            }
            let target = off + n_copied as u64;
            let mut lookup = self.leaf_at_offset(cx, target, BlockReqType::Write)?;

            let cap_len = match lookup.next_block_off {
                Some(nbo) => usize::try_from(nbo - target)
                    .unwrap_or(usize::MAX)
                    .min(n - n_copied),
                None => n - n_copied,
            };
            let old_len = lookup.block.contents.len();
            let copied = if cap_len > 0 {
                self.splitter.copy_until_split(
                    &mut lookup.block,
                    lookup.next_block_off.is_none(),
                    &data[n_copied..n_copied + cap_len],
                    target - lookup.start_off,
                )
            } else {
                0
            };

            if copied > 0 {
                let new_len = lookup.block.contents.len();
                acc.newly_dirtied_child_bytes += if lookup.was_dirty {
                    new_len as i64 - old_len as i64
                } else {
                    new_len as i64
                };
                n_copied += copied;
                self.write_back_leaf(cx, lookup, acc)?;
                continue;
            }

            // The covering leaf could not absorb anything; grow a new leaf
            // to the right of its materialized contents, or directly at the
            // write offset when a hole separates them.
            let contents_end = lookup.start_off + lookup.block.contents.len() as u64;
            let new_off = if contents_end < target { target } else { contents_end };
            self.add_leaf(cx, new_off, new_off > contents_end, acc)?;
        }
        if off + n as u64 > new_de.size {
            new_de.size = off + n as u64;
        }
        let bytes_extended = new_de.size.saturating_sub(de.size);
        Ok((new_de, bytes_extended))
    }

    /// Cache a mutated leaf and re-dirty its parent chain, zeroing stale
    /// encoded sizes and recording their unrefs.
    fn write_back_leaf(&mut self, cx: &Cx, lookup: LeafLookup, acc: &mut WriteAcc) -> Result<()> {
        let _ = cx;
        self.source.cache_dirty(lookup.ptr, &lookup.block)?;
        acc.push_dirty(lookup.ptr);
        let mut parents = lookup.parents;
        for parent in parents.iter_mut().rev() {
            let iptr = &mut parent.block.iptrs[parent.child_index];
            if iptr.info.encoded_size > 0 {
                acc.unrefs.push(iptr.info);
                iptr.info.encoded_size = 0;
            }
            self.source.cache_dirty(parent.ptr, &parent.block)?;
            acc.push_dirty(parent.ptr);
        }
        Ok(())
    }

    /// Append or insert an empty leaf at `new_off`, converting a direct
    /// top block to indirect first when necessary.
    fn add_leaf(&mut self, cx: &Cx, new_off: u64, holes: bool, acc: &mut WriteAcc) -> Result<()> {
        let tail = self.tail_ptr();
        let (mut top, top_was_dirty) = self.source.get_file_block(cx, tail, BlockReqType::Write)?;
        if !top.is_indirect {
            top = self.switch_to_indirect(cx, top, top_was_dirty, acc)?;
        }
        let new_ptr = self.new_temp_ptr(BlockDirectType::Direct);
        let idx = top.iptrs.partition_point(|p| p.off <= new_off);
        top.iptrs.insert(
            idx,
            IndirectFilePtr {
                info: BlockInfo {
                    ptr: new_ptr,
                    encoded_size: 0,
                },
                off: new_off,
                holes,
            },
        );
        if top.iptrs.len() > self.splitter.max_ptrs_per_block() {
            warn!(
                event = "indirect_fanout_exceeded",
                file = %self.file,
                children = top.iptrs.len()
            );
        }
        self.source.cache_dirty(new_ptr, &FileBlock::default())?;
        self.source.cache_dirty(tail, &top)?;
        acc.push_dirty(new_ptr);
        acc.push_dirty(tail);
        Ok(())
    }

    /// Move a direct top block's contents into a new first child, leaving
    /// the top indirect.  Bytes only count as newly dirtied when the top
    /// was clean, since a dirty top's bytes were counted when written.
    fn switch_to_indirect(
        &mut self,
        cx: &Cx,
        mut top: FileBlock,
        top_was_dirty: bool,
        acc: &mut WriteAcc,
    ) -> Result<FileBlock> {
        let _ = cx;
        let child_ptr = self.new_temp_ptr(BlockDirectType::Direct);
        let child = FileBlock::new_direct(std::mem::take(&mut top.contents));
        if !top_was_dirty {
            acc.newly_dirtied_child_bytes += child.contents.len() as i64;
        }
        self.source.cache_dirty(child_ptr, &child)?;
        acc.push_dirty(child_ptr);
        trace!(event = "file_became_indirect", file = %self.file);
        Ok(FileBlock::new_indirect(vec![IndirectFilePtr {
            info: BlockInfo {
                ptr: child_ptr,
                encoded_size: 0,
            },
            off: 0,
            holes: false,
        }]))
    }

    // ── Truncating ──────────────────────────────────────────────────────────

    /// Shrink the file to `size`, dirtying the new tail leaf and
    /// dereferencing every block past the cut.
    pub fn truncate_shrink(
        &mut self,
        cx: &Cx,
        size: u64,
        de: &DirEntry,
        acc: &mut WriteAcc,
    ) -> Result<DirEntry> {
        let tail = self.tail_ptr();
        let mut new_de = de.clone();
        let (top, top_dirty) = self.source.get_file_block(cx, tail, BlockReqType::Write)?;
        if !top.is_indirect {
            let mut top = top;
            let keep = usize::try_from(size).unwrap_or(usize::MAX);
            let old_len = top.contents.len();
            top.contents.truncate(keep);
            acc.newly_dirtied_child_bytes += if top_dirty {
                top.contents.len() as i64 - old_len as i64
            } else {
                top.contents.len() as i64
            };
            self.source.cache_dirty(tail, &top)?;
            acc.push_dirty(tail);
            new_de.size = size;
            return Ok(new_de);
        }

        let lookup = self.leaf_at_offset(cx, size, BlockReqType::Write)?;
        let mut leaf = lookup.block;
        let old_len = leaf.contents.len();
        let keep = usize::try_from(size - lookup.start_off)
            .unwrap_or(usize::MAX)
            .min(old_len);
        leaf.contents.truncate(keep);
        acc.newly_dirtied_child_bytes += if lookup.was_dirty {
            keep as i64 - old_len as i64
        } else {
            keep as i64
        };
        self.source.cache_dirty(lookup.ptr, &leaf)?;
        acc.push_dirty(lookup.ptr);

        let mut parents = lookup.parents;
        for parent in parents.iter_mut().rev() {
            let keep_children = parent.child_index + 1;
            let removed: Vec<IndirectFilePtr> =
                parent.block.iptrs.split_off(keep_children);
            for iptr in &removed {
                self.unref_subtree(cx, iptr, acc)?;
            }
            let iptr = &mut parent.block.iptrs[parent.child_index];
            if iptr.info.encoded_size > 0 {
                acc.unrefs.push(iptr.info);
                iptr.info.encoded_size = 0;
            }
            self.source.cache_dirty(parent.ptr, &parent.block)?;
            acc.push_dirty(parent.ptr);
        }
        new_de.size = size;
        Ok(new_de)
    }

    /// Dereference a removed child and everything below it.  Fetch errors
    /// that are recoverable for removal skip the subtree.
    fn unref_subtree(
        &mut self,
        cx: &Cx,
        iptr: &IndirectFilePtr,
        acc: &mut WriteAcc,
    ) -> Result<()> {
        acc.unrefs.push(iptr.info);
        if iptr.info.ptr.direct_type != BlockDirectType::Indirect {
            return Ok(());
        }
        let child = match self
            .source
            .get_file_block(cx, iptr.info.ptr, BlockReqType::Read)
        {
            Ok((child, _)) => child,
            Err(err) if err.is_recoverable_for_removal() => {
                warn!(event = "unref_enumeration_skipped", ptr = %iptr.info.ptr, error = %err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        for child_iptr in &child.iptrs {
            self.unref_subtree(cx, child_iptr, acc)?;
        }
        Ok(())
    }

    /// Extend the file to `size` by recording a hole instead of
    /// materializing zeros.
    pub fn truncate_extend(
        &mut self,
        cx: &Cx,
        size: u64,
        de: &DirEntry,
        acc: &mut WriteAcc,
    ) -> Result<DirEntry> {
        let tail = self.tail_ptr();
        let (mut top, top_was_dirty) = self.source.get_file_block(cx, tail, BlockReqType::Write)?;
        if !top.is_indirect {
            top = self.switch_to_indirect(cx, top, top_was_dirty, acc)?;
        }
        let hole_ptr = self.new_temp_ptr(BlockDirectType::Direct);
        top.iptrs.push(IndirectFilePtr {
            info: BlockInfo {
                ptr: hole_ptr,
                encoded_size: 0,
            },
            off: size,
            holes: true,
        });
        self.source.cache_dirty(hole_ptr, &FileBlock::default())?;
        self.source.cache_dirty(tail, &top)?;
        acc.push_dirty(hole_ptr);
        acc.push_dirty(tail);
        let mut new_de = de.clone();
        new_de.size = size;
        trace!(event = "hole_created", file = %self.file, size);
        Ok(new_de)
    }

    // ── Sync support ────────────────────────────────────────────────────────

    /// Resplit dirty leaves whose contents exceed the splitter's budget,
    /// carving overflow into fresh right siblings.  Unrefs of reshaped
    /// blocks accrue to `unrefs` even when the walk errors out partway.
    pub fn split(
        &mut self,
        cx: &Cx,
        is_dirty: &dyn Fn(BlockPointer) -> bool,
        unrefs: &mut Vec<BlockInfo>,
    ) -> Result<()> {
        let tail = self.tail_ptr();
        let (top, _) = self.source.get_file_block(cx, tail, BlockReqType::Write)?;
        if !top.is_indirect {
            return Ok(());
        }
        let mut off = 0_u64;
        loop {
            let lookup = self.leaf_at_offset(cx, off, BlockReqType::Write)?;
            let next = lookup.next_block_off;
            if is_dirty(lookup.ptr) {
                if let Some(cut) = self.splitter.check_split(&lookup.block) {
                    let mut leaf = lookup.block;
                    let overflow = leaf.contents.split_off(cut);
                    let new_off = lookup.start_off + cut as u64;
                    self.source.cache_dirty(lookup.ptr, &leaf)?;
                    let mut acc = WriteAcc::default();
                    self.add_leaf(cx, new_off, false, &mut acc)?;
                    let mut refreshed = self.leaf_at_offset(cx, new_off, BlockReqType::Write)?;
                    refreshed.block.contents = overflow;
                    let refreshed_ptr = refreshed.ptr;
                    self.write_back_leaf(cx, refreshed, &mut acc)?;
                    unrefs.append(&mut acc.unrefs);
                    trace!(event = "leaf_resplit", ptr = %refreshed_ptr, cut);
                }
            }
            match next {
                Some(nbo) => off = nbo,
                None => break,
            }
        }
        Ok(())
    }

    /// Assign permanent IDs to every dirty child block, staging the
    /// ciphertext into `bps`.  Returns new block info mapped to the old
    /// pointer each one replaces.
    pub fn ready(
        &mut self,
        cx: &Cx,
        tlf: TlfId,
        md: &FolderMetadata,
        bcache: &dyn BlockCache,
        block_ops: &dyn BlockOps,
        bps: &mut BlockPutState,
        is_dirty: &dyn Fn(BlockPointer) -> bool,
    ) -> Result<HashMap<BlockInfo, BlockPointer>> {
        let tail = self.tail_ptr();
        let (mut top, _) = self.source.get_file_block(cx, tail, BlockReqType::Write)?;
        if !top.is_indirect {
            return Ok(HashMap::new());
        }
        let mut new_to_old = HashMap::new();
        self.ready_children(cx, tlf, md, bcache, block_ops, bps, is_dirty, &mut top,
                            &mut new_to_old)?;
        self.source.cache_dirty(tail, &top)?;
        Ok(new_to_old)
    }

    #[allow(clippy::too_many_arguments)]
    fn ready_children(
        &mut self,
        cx: &Cx,
        tlf: TlfId,
        md: &FolderMetadata,
        bcache: &dyn BlockCache,
        block_ops: &dyn BlockOps,
        bps: &mut BlockPutState,
        is_dirty: &dyn Fn(BlockPointer) -> bool,
        block: &mut FileBlock,
        new_to_old: &mut HashMap<BlockInfo, BlockPointer>,
    ) -> Result<()> {
        for iptr in &mut block.iptrs {
            let old_ptr = iptr.info.ptr;
            if !is_dirty(old_ptr) {
                continue;
            }
            let (mut child, _) = self.source.get_file_block(cx, old_ptr, BlockReqType::Write)?;
            if child.is_indirect {
                self.ready_children(cx, tlf, md, bcache, block_ops, bps, is_dirty, &mut child,
                                    new_to_old)?;
            }
            let (info, _plain, ready_data) = ready_file_block(
                cx, tlf, md, bcache, block_ops, self.crypto, &child, self.charged_to,
            )?;
            bps.add_new_block(info.ptr, Block::File(child), ready_data);
            iptr.info = info;
            new_to_old.insert(info, old_ptr);
        }
        Ok(())
    }

    /// Enumerate block infos for every child of every indirect block.
    pub fn indirect_block_infos(&mut self, cx: &Cx) -> Result<Vec<BlockInfo>> {
        let tail = self.tail_ptr();
        let (top, _) = self.source.get_file_block(cx, tail, BlockReqType::Read)?;
        self.indirect_block_infos_with_top(cx, &top)
    }

    /// As `indirect_block_infos`, but starting from a caller-held top
    /// block.
    pub fn indirect_block_infos_with_top(
        &mut self,
        cx: &Cx,
        top: &FileBlock,
    ) -> Result<Vec<BlockInfo>> {
        let mut infos = Vec::new();
        if !top.is_indirect {
            return Ok(infos);
        }
        let mut stack: Vec<IndirectFilePtr> = top.iptrs.clone();
        while let Some(iptr) = stack.pop() {
            infos.push(iptr.info);
            if iptr.info.ptr.direct_type != BlockDirectType::Indirect {
                continue;
            }
            match self
                .source
                .get_file_block(cx, iptr.info.ptr, BlockReqType::Read)
            {
                Ok((child, _)) => stack.extend(child.iptrs),
                Err(err) if err.is_recoverable_for_removal() => {
                    warn!(event = "info_enumeration_skipped", ptr = %iptr.info.ptr, error = %err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(infos)
    }

    /// Zero the encoded size of any indirect pointer in `ptrs`, so a
    /// reverted sync treats those children as unsized dirty blocks again.
    /// Returns the pointers actually found.
    pub fn find_iptrs_and_clear_size(
        &mut self,
        cx: &Cx,
        ptrs: &HashSet<BlockPointer>,
    ) -> Result<HashSet<BlockPointer>> {
        let tail = self.tail_ptr();
        let (mut top, _) = self.source.get_file_block(cx, tail, BlockReqType::Write)?;
        let mut found = HashSet::new();
        if !top.is_indirect {
            return Ok(found);
        }
        let modified = self.clear_sizes_in(cx, &mut top, ptrs, &mut found)?;
        if modified {
            self.source.cache_dirty(tail, &top)?;
        }
        Ok(found)
    }

    fn clear_sizes_in(
        &mut self,
        cx: &Cx,
        block: &mut FileBlock,
        ptrs: &HashSet<BlockPointer>,
        found: &mut HashSet<BlockPointer>,
    ) -> Result<bool> {
        let mut modified = false;
        for iptr in &mut block.iptrs {
            if ptrs.contains(&iptr.info.ptr) {
                iptr.info.encoded_size = 0;
                found.insert(iptr.info.ptr);
                modified = true;
            } else if iptr.info.ptr.direct_type == BlockDirectType::Indirect {
                let (mut child, _) =
                    self.source.get_file_block(cx, iptr.info.ptr, BlockReqType::Write)?;
                if child.is_indirect && self.clear_sizes_in(cx, &mut child, ptrs, found)? {
                    self.source.cache_dirty(iptr.info.ptr, &child)?;
                }
            }
        }
        Ok(modified)
    }

    /// Copy the whole file, deduping leaf blocks under fresh ref-nonces
    /// and assigning new temporary pointers to every indirect block.
    /// Returns the new top pointer and all new child pointers.
    pub fn deep_copy(&mut self, cx: &Cx) -> Result<(BlockPointer, Vec<BlockPointer>)> {
        let tail = self.tail_ptr();
        let (top, _) = self.source.get_file_block(cx, tail, BlockReqType::Read)?;
        let mut children = Vec::new();
        let new_top_ptr = self.copy_tree(cx, &top, &mut children)?;
        Ok((new_top_ptr, children))
    }

    fn copy_tree(
        &mut self,
        cx: &Cx,
        block: &FileBlock,
        children_out: &mut Vec<BlockPointer>,
    ) -> Result<BlockPointer> {
        let mut copy = block.clone();
        if copy.is_indirect {
            for iptr in &mut copy.iptrs {
                let (child, _) = self
                    .source
                    .get_file_block(cx, iptr.info.ptr, BlockReqType::Read)?;
                let new_child_ptr = if child.is_indirect {
                    self.copy_tree(cx, &child, children_out)?
                } else {
                    let mut p = iptr.info.ptr;
                    p.ref_nonce = self.crypto.block_ref_nonce();
                    p.context.creator = self.charged_to;
                    self.source.cache_dirty(p, &child)?;
                    p
                };
                children_out.push(new_child_ptr);
                iptr.info = BlockInfo {
                    ptr: new_child_ptr,
                    encoded_size: 0,
                };
            }
        }
        let direct_type = if copy.is_indirect {
            BlockDirectType::Indirect
        } else {
            BlockDirectType::Direct
        };
        let new_ptr = self.new_temp_ptr(direct_type);
        self.source.cache_dirty(new_ptr, &copy)?;
        Ok(new_ptr)
    }
}

/// Ready a single file block: dedupe direct contents against the clean
/// cache, encode, and build the permanent block info.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ready_file_block(
    cx: &Cx,
    tlf: TlfId,
    md: &FolderMetadata,
    bcache: &dyn BlockCache,
    block_ops: &dyn BlockOps,
    crypto: &BlockCrypto,
    block: &FileBlock,
    charged_to: UserId,
) -> Result<(BlockInfo, usize, ReadyBlockData)> {
    let wrapped = Block::File(block.clone());
    let mut dup_ptr = None;
    if !block.is_indirect {
        dup_ptr = bcache.check_for_known_ptr(tlf, block)?;
    }
    let (id, plain_size, ready_data) = block_ops.ready(cx, md, &wrapped)?;
    let direct_type = if block.is_indirect {
        BlockDirectType::Indirect
    } else {
        BlockDirectType::Direct
    };
    let ptr = match dup_ptr {
        Some(mut p) => {
            p.ref_nonce = crypto.block_ref_nonce();
            p.context.creator = charged_to;
            p.direct_type = direct_type;
            p
        }
        None => BlockPointer {
            id,
            key_gen: md.key_gen,
            data_ver: wrapped.data_version(),
            direct_type,
            ref_nonce: RefNonce::ZERO,
            context: BlockContext {
                creator: charged_to,
                usage: BlockUsage::Data,
            },
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
