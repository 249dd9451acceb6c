#![forbid(unsafe_code)]
//! Per-folder dirty block engine.
//!
//! Owns all dirty file and directory blocks for a single folder/branch,
//! implements copy-on-write against the shared clean block cache, tracks
//! unsynced byte counts for backpressure, defers writes that race an
//! in-flight sync, recovers from partial sync failures, and fast-forwards
//! the node cache across remote metadata revisions.

mod dir_data;
mod dir_ops;
mod dirty_file;
mod file_data;
mod lock;
mod node_cache;
mod pointers;
mod sources;
mod state;
mod sync;
mod write;

pub use dir_ops::DirCacheUndo;
pub use lock::{BlockReqType, LockState};
pub use node_cache::{Node, NodeCache, NodeCacheStandard, NodeCacheUndo, NodeChange};
pub use sync::{FileSyncState, StartSyncResult, ready_block};

use crate::dir_data::DirData;
use crate::file_data::FileData;
use crate::lock::{BlockLock, ReadLockCtx};
use crate::sources::{ReadDirSource, ReadFileSource, ScratchFileSource, WriteDirSource};
use crate::state::LockedState;
use asupersync::Cx;
use dfs_block::{BlockCache, BlockCrypto, BlockOps, BlockSplitter, Clock, Codec, DirtyBlockCache,
                DirtyOpJournal, LocalBlockCache, PrefetchPriority, Reporter, SessionProvider};
use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockInfo, BlockPointer, BlockRef, BlockShape, BranchName, DataVer,
                DirBlock, DirEntry, EntryInfo, EntryType, FileBlock, FolderBranch,
                FolderMetadata, FolderPath, TlfId, UserId, WriteRange};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::time::Duration;
use tracing::{debug, trace};

// ── Tunables ────────────────────────────────────────────────────────────────

/// Maximum worker fan-out for parallel encoded-size sums.
pub const NUM_BLOCK_SIZE_WORKERS_MAX: usize = 50;

/// An extending truncate reaching past this many bytes above the current
/// tail creates a hole instead of materializing zeros.
pub const TRUNCATE_EXTEND_CUTOFF: u64 = 128 * 1024;

/// How long a write may block on the dirty buffer before logging once.
pub const DEFERRED_WRITE_LOG_DELAY: Duration = Duration::from_millis(100);

// ── Engine surface types ────────────────────────────────────────────────────

/// Overall dirty state of the folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallBlockState {
    /// No outstanding local writes.
    Clean,
    /// Outstanding local writes have not yet been synced.
    Dirty,
}

/// Observer of locally applied changes.
pub trait ChangeObserver: Send + Sync {
    fn local_change(&self, node: Node, write: WriteRange);
}

#[derive(Default)]
pub(crate) struct ObserverList {
    observers: Mutex<Vec<Arc<dyn ChangeObserver>>>,
}

impl ObserverList {
    fn local_change(&self, node: Node, write: WriteRange) {
        for obs in self.observers.lock().iter() {
            obs.local_change(node, write);
        }
    }
}

/// Collaborators the engine consumes.
pub struct EngineConfig {
    pub block_cache: Arc<dyn BlockCache>,
    pub dirty_bcache: Arc<dyn DirtyBlockCache>,
    pub block_ops: Arc<dyn BlockOps>,
    pub splitter: Arc<dyn BlockSplitter>,
    pub crypto: BlockCrypto,
    pub codec: Codec,
    pub reporter: Arc<dyn Reporter>,
    pub journal: Option<Arc<dyn DirtyOpJournal>>,
    pub sessions: Arc<dyn SessionProvider>,
    pub clock: Arc<dyn Clock>,
    /// Highest block data version this engine understands.
    pub supported_data_version: DataVer,
}

/// The per-folder dirty block engine.
pub struct FolderBlocks {
    pub(crate) config: Arc<EngineConfig>,
    folder_branch: FolderBranch,
    pub(crate) lock: BlockLock,
    pub(crate) node_cache: Arc<dyn NodeCache>,
    pub(crate) observers: ObserverList,
    charged_to: Mutex<Option<UserId>>,
    /// Poked (non-blocking) when the dirty buffer wants a sync.
    force_sync_tx: SyncSender<()>,
}

impl FolderBlocks {
    pub fn new(
        config: Arc<EngineConfig>,
        folder_branch: FolderBranch,
        node_cache: Arc<dyn NodeCache>,
        force_sync_tx: SyncSender<()>,
    ) -> Self {
        Self {
            config,
            folder_branch,
            lock: BlockLock::new(LockedState::default()),
            node_cache,
            observers: ObserverList::default(),
            charged_to: Mutex::new(None),
            force_sync_tx,
        }
    }

    pub(crate) fn id(&self) -> TlfId {
        self.folder_branch.tlf
    }

    pub(crate) fn branch(&self) -> &BranchName {
        &self.folder_branch.branch
    }

    #[must_use]
    pub fn folder_branch(&self) -> &FolderBranch {
        &self.folder_branch
    }

    #[must_use]
    pub fn node_cache(&self) -> &Arc<dyn NodeCache> {
        &self.node_cache
    }

    pub fn register_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.observers.lock().push(observer);
    }

    pub(crate) fn notify_local_change(&self, node: Node, write: WriteRange) {
        self.observers.local_change(node, write);
    }

    pub(crate) fn poke_force_sync(&self) {
        if self.force_sync_tx.try_send(()).is_ok() {
            debug!(event = "force_sync_requested", tlf = %self.id());
        }
    }

    /// The identity charged for new blocks, cached after first lookup.
    pub(crate) fn charged_to(&self, cx: &Cx) -> Result<UserId> {
        if let Some(user) = *self.charged_to.lock() {
            return Ok(user);
        }
        let session = self.config.sessions.current_session(cx)?;
        *self.charged_to.lock() = Some(session.user);
        Ok(session.user)
    }

    /// Drop the cached charged-to identity.
    pub fn clear_charged_to(&self, ls: &LockState) {
        let _guard = self.lock.write(ls);
        *self.charged_to.lock() = None;
    }

    /// Overall block state of this folder.
    pub fn get_state(&self, ls: &LockState) -> OverallBlockState {
        let rg = self.lock.read(ls);
        if rg.dirty_files.is_empty()
            && rg.dirty_dirs.is_empty()
            && rg.dirty_root_dir_entry.is_none()
        {
            OverallBlockState::Clean
        } else {
            OverallBlockState::Dirty
        }
    }

    // ── Block fetch path ────────────────────────────────────────────────────

    pub(crate) fn check_data_version(&self, ptr: BlockPointer) -> Result<()> {
        if ptr.data_ver > self.config.supported_data_version {
            return Err(EngineError::DataVersionTooNew {
                found: ptr.data_ver.0,
                supported: self.config.supported_data_version.0,
            });
        }
        Ok(())
    }

    /// Dirty cache first, then the clean cache.  A clean-cache hit is
    /// re-submitted to the prefetcher at on-demand priority so downstream
    /// prefetches trigger correctly.
    fn block_from_caches(&self, ptr: BlockPointer) -> Option<Block> {
        if let Ok(block) = self.config.dirty_bcache.get(self.id(), ptr, self.branch()) {
            return Some(block);
        }
        if let Ok((block, _status, _lifetime)) = self.config.block_cache.get_with_prefetch(ptr) {
            self.config
                .block_ops
                .prefetcher()
                .process_block_for_prefetch(ptr, PrefetchPriority::OnDemand);
            return Some(block);
        }
        None
    }

    fn fetch_block_remote(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        ptr: BlockPointer,
        shape: BlockShape,
        notify: Option<&FolderPath>,
    ) -> Result<Block> {
        self.check_data_version(ptr)?;
        let _notify_guard = notify
            .filter(|p| p.is_valid_for_notification())
            .map(|p| {
                self.config.reporter.notify_read(p, false);
                ReadNotifyGuard {
                    reporter: self.config.reporter.as_ref(),
                    path: p,
                }
            });
        trace!(event = "remote_block_fetch", ptr = %ptr);
        self.config.block_ops.get(cx, md, ptr, shape)
    }

    /// Fetch under a read hold.  Plain reads release the lock across the
    /// network; lookups never do, because they race pointer updates.
    pub(crate) fn get_block_read(
        &self,
        cx: &Cx,
        rg: &mut ReadLockCtx<'_>,
        md: &FolderMetadata,
        ptr: BlockPointer,
        shape: BlockShape,
        notify: Option<&FolderPath>,
        kind: BlockReqType,
    ) -> Result<Block> {
        if !ptr.is_valid() {
            return Err(EngineError::InvalidBlockRef {
                ptr: ptr.to_string(),
            });
        }
        if let Some(block) = self.block_from_caches(ptr) {
            return Ok(block);
        }
        match kind {
            BlockReqType::Read => {
                rg.with_unlocked(|| self.fetch_block_remote(cx, md, ptr, shape, notify))
            }
            BlockReqType::Lookup => self.fetch_block_remote(cx, md, ptr, shape, notify),
            BlockReqType::Write | BlockReqType::ReadParallel => {
                panic!("block request kind {kind:?} cannot use a read hold")
            }
        }
    }

    /// Fetch with no lock interaction: used under the write hold (which is
    /// never released mid-sequence) and by parallel fan-out workers.
    pub(crate) fn get_block_no_unlock(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        ptr: BlockPointer,
        shape: BlockShape,
        notify: Option<&FolderPath>,
    ) -> Result<Block> {
        if !ptr.is_valid() {
            return Err(EngineError::InvalidBlockRef {
                ptr: ptr.to_string(),
            });
        }
        if let Some(block) = self.block_from_caches(ptr) {
            return Ok(block);
        }
        self.fetch_block_remote(cx, md, ptr, shape, notify)
    }

    pub(crate) fn get_file_block_read(
        &self,
        cx: &Cx,
        rg: &mut ReadLockCtx<'_>,
        md: &FolderMetadata,
        ptr: BlockPointer,
        file: &FolderPath,
        kind: BlockReqType,
    ) -> Result<(FileBlock, bool)> {
        let block = self.get_block_read(cx, rg, md, ptr, BlockShape::File, Some(file), kind)?;
        let fblock = block.into_file().ok_or_else(|| EngineError::NotFileBlock {
            ptr: ptr.to_string(),
        })?;
        let was_dirty = self.config.dirty_bcache.is_dirty(self.id(), ptr, self.branch());
        Ok((fblock, was_dirty))
    }

    pub(crate) fn get_file_block_no_unlock(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        ptr: BlockPointer,
        file: &FolderPath,
    ) -> Result<(FileBlock, bool)> {
        let block = self.get_block_no_unlock(cx, md, ptr, BlockShape::File, Some(file))?;
        let fblock = block.into_file().ok_or_else(|| EngineError::NotFileBlock {
            ptr: ptr.to_string(),
        })?;
        let was_dirty = self.config.dirty_bcache.is_dirty(self.id(), ptr, self.branch());
        Ok((fblock, was_dirty))
    }

    pub(crate) fn get_dir_block_read(
        &self,
        cx: &Cx,
        rg: &mut ReadLockCtx<'_>,
        md: &FolderMetadata,
        ptr: BlockPointer,
        dir: &FolderPath,
        kind: BlockReqType,
    ) -> Result<(DirBlock, bool)> {
        // Read notifications only fire for file reads.
        let block = self.get_block_read(cx, rg, md, ptr, BlockShape::Dir, None, kind)?;
        let dblock = block.into_dir().ok_or_else(|| EngineError::NotDirBlock {
            ptr: ptr.to_string(),
        })?;
        let _ = dir;
        let was_dirty = self.config.dirty_bcache.is_dirty(self.id(), ptr, self.branch());
        Ok((dblock, was_dirty))
    }

    pub(crate) fn get_dir_block_no_unlock(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        ptr: BlockPointer,
        dir: &FolderPath,
    ) -> Result<(DirBlock, bool)> {
        let block = self.get_block_no_unlock(cx, md, ptr, BlockShape::Dir, None)?;
        let dblock = block.into_dir().ok_or_else(|| EngineError::NotDirBlock {
            ptr: ptr.to_string(),
        })?;
        let _ = dir;
        let was_dirty = self.config.dirty_bcache.is_dirty(self.id(), ptr, self.branch());
        Ok((dblock, was_dirty))
    }

    /// Put a freshly dirtied file block into the dirty cache, tracking it
    /// in the file's dirty registry.  Dirtying a block an in-flight sync
    /// still covers flags the operation for deferral.
    pub(crate) fn cache_file_block_locked(
        &self,
        st: &mut LockedState,
        ptr: BlockPointer,
        file: &FolderPath,
        block: &FileBlock,
    ) -> Result<()> {
        let df = st.get_or_create_dirty_file(file, &self.config.dirty_bcache);
        let (_newly_tracked, is_syncing) = df.set_block_dirty(ptr);
        self.config.dirty_bcache.put(
            self.id(),
            ptr,
            self.branch(),
            Block::File(block.clone()),
        )?;
        if is_syncing {
            st.do_defer_write = true;
        }
        Ok(())
    }

    // ── Data adapters ───────────────────────────────────────────────────────

    pub(crate) fn file_data_write<'e, 's, 'p>(
        &'e self,
        st: &'s mut LockedState,
        md: &'e FolderMetadata,
        file: &'p FolderPath,
        charged_to: UserId,
    ) -> FileData<'e, sources::WriteFileSource<'e, 's, 'p>> {
        FileData::new(
            file.clone(),
            charged_to,
            md.key_gen,
            self.config.splitter.as_ref(),
            &self.config.crypto,
            sources::WriteFileSource {
                eng: self,
                st,
                md,
                file,
            },
        )
    }

    pub(crate) fn file_data_read<'e, 'l, 'g, 'p>(
        &'e self,
        rg: &'g mut ReadLockCtx<'l>,
        md: &'e FolderMetadata,
        file: &'p FolderPath,
    ) -> FileData<'e, ReadFileSource<'e, 'l, 'g, 'p>> {
        FileData::new(
            file.clone(),
            UserId::NIL,
            md.key_gen,
            self.config.splitter.as_ref(),
            &self.config.crypto,
            ReadFileSource {
                eng: self,
                rg,
                md,
                file,
            },
        )
    }

    pub(crate) fn dir_data_write<'e, 'p>(
        &'e self,
        md: &'e FolderMetadata,
        dir: &'p FolderPath,
        charged_to: UserId,
    ) -> DirData<'e, WriteDirSource<'e, 'p>> {
        DirData::new(
            dir.clone(),
            charged_to,
            md.key_gen,
            self.config.splitter.as_ref(),
            &self.config.crypto,
            WriteDirSource { eng: self, md, dir },
        )
    }

    pub(crate) fn dir_data_read<'e, 'l, 'g, 'p>(
        &'e self,
        rg: &'g mut ReadLockCtx<'l>,
        md: &'e FolderMetadata,
        dir: &'p FolderPath,
    ) -> DirData<'e, ReadDirSource<'e, 'l, 'g, 'p>> {
        DirData::new(
            dir.clone(),
            UserId::NIL,
            md.key_gen,
            self.config.splitter.as_ref(),
            &self.config.crypto,
            ReadDirSource {
                eng: self,
                rg,
                md,
                dir,
            },
        )
    }

    // ── Read APIs ───────────────────────────────────────────────────────────

    /// Fetch a block of unknown shape, for internal operations like
    /// conflict resolution and state checking.
    pub fn get_block_for_reading(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        ptr: BlockPointer,
    ) -> Result<Block> {
        let mut rg = self.lock.read(ls);
        self.get_block_read(cx, &mut rg, md, ptr, BlockShape::Common, None, BlockReqType::Read)
    }

    pub fn get_file_block_for_reading(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        ptr: BlockPointer,
        file: &FolderPath,
    ) -> Result<FileBlock> {
        let mut rg = self.lock.read(ls);
        let (fblock, _) = self.get_file_block_read(cx, &mut rg, md, ptr, file, BlockReqType::Read)?;
        Ok(fblock)
    }

    pub fn get_dir_block_for_reading(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        ptr: BlockPointer,
        dir: &FolderPath,
    ) -> Result<DirBlock> {
        let mut rg = self.lock.read(ls);
        let (dblock, _) = self.get_dir_block_read(cx, &mut rg, md, ptr, dir, BlockReqType::Read)?;
        Ok(dblock)
    }

    /// The directory block for a possibly-dirty directory.
    pub fn get_dirty_dir(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: &FolderPath,
        kind: BlockReqType,
    ) -> Result<DirBlock> {
        let mut rg = self.lock.read(ls);
        // A write-intent fetch here gets an owned copy anyway; route it
        // through the no-release path so it cannot race pointer updates.
        let kind = match kind {
            BlockReqType::Write => BlockReqType::Lookup,
            other => other,
        };
        let (dblock, _) =
            self.get_dir_block_read(cx, &mut rg, md, dir.tail_pointer(), dir, kind)?;
        Ok(dblock)
    }

    pub fn get_children(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: &FolderPath,
    ) -> Result<BTreeMap<String, EntryInfo>> {
        let mut rg = self.lock.read(ls);
        let mut dd = self.dir_data_read(&mut rg, md, dir);
        dd.get_children(cx)
    }

    pub fn get_entries(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: &FolderPath,
    ) -> Result<BTreeMap<String, DirEntry>> {
        let mut rg = self.lock.read(ls);
        let mut dd = self.dir_data_read(&mut rg, md, dir);
        dd.get_entries(cx)
    }

    pub(crate) fn get_entry_read(
        &self,
        cx: &Cx,
        rg: &mut ReadLockCtx<'_>,
        md: &FolderMetadata,
        file: &FolderPath,
        include_deleted: bool,
    ) -> Result<DirEntry> {
        if !file.has_valid_parent() {
            if let Some(de) = rg.dirty_root_dir_entry.clone() {
                return Ok(de);
            }
            return Ok(md.root_dir_entry());
        }
        let parent = file.parent_path();
        let looked_up = {
            let mut dd = self.dir_data_read(rg, md, &parent);
            dd.lookup(cx, file.tail_name())
        };
        self.entry_or_unlinked(looked_up, file, include_deleted)
    }

    /// Shared fallback to the node cache's unlinked-entry store.
    pub(crate) fn entry_or_unlinked(
        &self,
        looked_up: Result<DirEntry>,
        file: &FolderPath,
        include_deleted: bool,
    ) -> Result<DirEntry> {
        match looked_up {
            Ok(de) => {
                if include_deleted && de.info.ptr != file.tail_pointer() {
                    if let Some(de) = self.unlinked_entry_for(file) {
                        return Ok(de);
                    }
                }
                Ok(de)
            }
            Err(EngineError::NoSuchName { name }) if include_deleted => {
                self.unlinked_entry_for(file)
                    .ok_or(EngineError::NoSuchName { name })
            }
            Err(err) => Err(err),
        }
    }

    fn unlinked_entry_for(&self, file: &FolderPath) -> Option<DirEntry> {
        let node = self.node_cache.get(file.tail_ref())?;
        if !self.node_cache.is_unlinked(node) {
            return None;
        }
        Some(self.node_cache.unlinked_dir_entry(node))
    }

    /// The possibly-dirty entry of `file` in its parent directory.
    pub fn get_entry(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
    ) -> Result<DirEntry> {
        let mut rg = self.lock.read(ls);
        self.get_entry_read(cx, &mut rg, md, file, false)
    }

    /// Like `get_entry`, but consults the unlinked-entry store for files
    /// that have been removed while open.
    pub fn get_entry_even_if_deleted(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
    ) -> Result<DirEntry> {
        let mut rg = self.lock.read(ls);
        self.get_entry_read(cx, &mut rg, md, file, true)
    }

    /// Look up a name in a directory, materializing a node for it.  Done
    /// entirely under the block lock to avoid racing pointer updates.
    pub fn lookup(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: Node,
        name: &str,
    ) -> Result<(Option<Node>, DirEntry)> {
        let mut rg = self.lock.read(ls);
        let dir_path = self.node_cache.path_from_node(dir);
        if !dir_path.is_valid() {
            return Err(EngineError::InvalidPath {
                path: dir_path.to_string(),
            });
        }
        let child_path = dir_path.child_path_no_ptr(name);
        let de = {
            let looked_up = {
                let mut dd = self.dir_data_read(&mut rg, md, &dir_path);
                dd.lookup(cx, name)
            };
            self.entry_or_unlinked(looked_up, &child_path, false)?
        };
        if de.entry_type == EntryType::Sym {
            return Ok((None, de));
        }
        let node = self.node_cache.get_or_create(de.info.ptr, name, Some(dir))?;
        Ok((Some(node), de))
    }

    /// Read from the file into `dest` at `off`, returning bytes read.
    pub fn read(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: Node,
        dest: &mut [u8],
        off: u64,
    ) -> Result<usize> {
        let mut rg = self.lock.read(ls);
        let file_path = self.node_cache.path_from_node(file);
        if !file_path.is_valid() {
            return Err(EngineError::InvalidPath {
                path: file_path.to_string(),
            });
        }
        trace!(event = "file_read", file = %file_path.tail_pointer(), off, len = dest.len());
        let mut fd = self.file_data_read(&mut rg, md, &file_path);
        fd.read(cx, dest, off)
    }

    /// Infos for all indirect blocks of the given file.
    pub fn get_indirect_file_block_infos(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
    ) -> Result<Vec<BlockInfo>> {
        let mut rg = self.lock.read(ls);
        let mut fd = self.file_data_read(&mut rg, md, file);
        fd.indirect_block_infos(cx)
    }

    /// As `get_indirect_file_block_infos`, starting from a caller-held top
    /// block.
    pub fn get_indirect_file_block_infos_with_top_block(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
        top: &FileBlock,
    ) -> Result<Vec<BlockInfo>> {
        let mut rg = self.lock.read(ls);
        let mut fd = self.file_data_read(&mut rg, md, file);
        fd.indirect_block_infos_with_top(cx, top)
    }

    /// Infos for all indirect blocks of the given directory.
    pub fn get_indirect_dir_block_infos(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: &FolderPath,
    ) -> Result<Vec<BlockInfo>> {
        let mut rg = self.lock.read(ls);
        let mut dd = self.dir_data_read(&mut rg, md, dir);
        dd.indirect_block_infos(cx)
    }

    /// Copy a whole file into the scratch cache, deduping leaf blocks and
    /// assigning fresh pointers to indirect blocks.
    pub fn deep_copy_file(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: &FolderPath,
        lbc: &mut LocalBlockCache,
    ) -> Result<(BlockPointer, Vec<BlockPointer>)> {
        let charged_to = self.charged_to(cx)?;
        let mut rg = self.lock.read(ls);
        let mut fd = FileData::new(
            file.clone(),
            charged_to,
            md.key_gen,
            self.config.splitter.as_ref(),
            &self.config.crypto,
            ScratchFileSource {
                eng: self,
                rg: &mut rg,
                md,
                file,
                lbc,
            },
        );
        fd.deep_copy(cx)
    }

    // ── Parallel size sum ───────────────────────────────────────────────────

    fn clean_encoded_block_size_parallel(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        ptr: BlockPointer,
    ) -> Result<u32> {
        if !ptr.is_valid() {
            return Err(EngineError::InvalidBlockRef {
                ptr: ptr.to_string(),
            });
        }
        if let Ok(size) = self.config.block_cache.get_encoded_size(ptr) {
            return Ok(size);
        }
        self.check_data_version(ptr)?;
        self.config.block_ops.get_encoded_size(cx, md, ptr)
    }

    /// Sum the encoded sizes of clean blocks, fanning out over bounded
    /// workers.  Recoverable-for-removal failures are tolerated for
    /// pointers in `ignore`; the first other error cancels the sweep.
    pub fn get_clean_encoded_blocks_size_sum(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        ptrs: &[BlockPointer],
        ignore: &HashSet<BlockPointer>,
    ) -> Result<u64> {
        cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
        if ptrs.is_empty() {
            return Ok(0);
        }
        let rg = self.lock.read(ls);
        ls.set_parallel_fanout(true);

        let cursor = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let sum = AtomicU64::new(0);
        let first_err: Mutex<Option<EngineError>> = Mutex::new(None);
        let workers = NUM_BLOCK_SIZE_WORKERS_MAX.min(ptrs.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    // Workers run lock-free under the coordinator's hold
                    // and carry their own long-lived context; cancellation
                    // rides the shared stop flag.
                    let worker_cx = Cx::for_testing();
                    loop {
                        let i = cursor.fetch_add(1, Ordering::Relaxed);
                        if i >= ptrs.len() || stop.load(Ordering::Acquire) {
                            break;
                        }
                        let ptr = ptrs[i];
                        match self.clean_encoded_block_size_parallel(&worker_cx, md, ptr) {
                            Ok(size) => {
                                sum.fetch_add(u64::from(size), Ordering::Relaxed);
                            }
                            Err(err)
                                if err.is_recoverable_for_removal()
                                    && ignore.contains(&ptr) =>
                            {
                                debug!(
                                    event = "size_sum_ignorable_error",
                                    ptr = %ptr,
                                    error = %err
                                );
                            }
                            Err(err) => {
                                let mut slot = first_err.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                                stop.store(true, Ordering::Release);
                                break;
                            }
                        }
                    }
                });
            }
        });

        ls.set_parallel_fanout(false);
        drop(rg);
        if let Some(err) = first_err.lock().take() {
            return Err(err);
        }
        Ok(sum.load(Ordering::Relaxed))
    }

    // ── Dirty-state queries ─────────────────────────────────────────────────

    /// Whether the given file needs a sync.
    pub fn is_dirty(&self, ls: &LockState, file: &FolderPath) -> bool {
        let rg = self.lock.read(ls);
        if self
            .config
            .dirty_bcache
            .is_dirty(self.id(), file.tail_pointer(), self.branch())
        {
            return true;
        }
        if rg.dirty_files.contains_key(&file.tail_pointer()) {
            return true;
        }
        rg.unref_cache.contains_key(&file.tail_ref())
    }

    /// References of all known dirty files.
    pub fn get_dirty_file_block_refs(&self, ls: &LockState) -> Vec<BlockRef> {
        let rg = self.lock.read(ls);
        rg.unref_cache.keys().copied().collect()
    }

    /// References of all known dirty directories.
    pub fn get_dirty_dir_block_refs(&self, ls: &LockState) -> Vec<BlockRef> {
        let rg = self.lock.read(ls);
        rg.dirty_dirs.keys().map(|p| p.as_ref()).collect()
    }

    /// Number of queued deferred writes, for diagnostics.
    pub fn deferred_write_count(&self, ls: &LockState) -> usize {
        let rg = self.lock.read(ls);
        rg.deferred.values().map(|ds| ds.writes.len()).sum()
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    pub(crate) fn clear_cache_info_locked(
        &self,
        st: &mut LockedState,
        file: &FolderPath,
    ) -> Result<()> {
        st.unref_cache.remove(&file.tail_ref());
        if let Some(mut df) = st.dirty_files.remove(&file.tail_pointer()) {
            df.finish_sync()?;
        }
        Ok(())
    }

    /// Remove any cached sync state for the given file.
    pub fn clear_cache_info(&self, ls: &LockState, file: &FolderPath) -> Result<()> {
        let mut wg = self.lock.write(ls);
        self.clear_cache_info_locked(&mut wg, file)
    }

    /// Drop every dirty directory block and the root-entry shadow, used
    /// when local directory state is being abandoned.
    pub fn clear_all_dirty_dirs(&self, cx: &Cx, ls: &LockState, md: &FolderMetadata) {
        let mut wg = self.lock.write(ls);
        let st: &mut LockedState = &mut wg;
        let dirty_bcache = &self.config.dirty_bcache;
        let ptrs: Vec<BlockPointer> = st.dirty_dirs.keys().copied().collect();
        for ptr in ptrs {
            let dir = FolderPath::new(
                self.folder_branch.clone(),
                vec![dfs_types::PathNode {
                    ptr,
                    name: ptr.to_string(),
                }],
            );
            let child_ptrs = {
                let mut dd = self.dir_data_write(md, &dir, UserId::NIL);
                dd.dirty_child_ptrs(cx, &|p| {
                    dirty_bcache.is_dirty(self.folder_branch.tlf, p, &self.folder_branch.branch)
                })
            };
            match child_ptrs {
                Ok(children) => {
                    for child in children {
                        if let Err(err) = dirty_bcache.delete(self.id(), child, self.branch()) {
                            debug!(event = "dirty_dir_child_delete_failed", ptr = %child, error = %err);
                        }
                    }
                }
                Err(err) => {
                    debug!(event = "dirty_dir_enumeration_failed", ptr = %ptr, error = %err);
                }
            }
            if let Err(err) = dirty_bcache.delete(self.id(), ptr, self.branch()) {
                debug!(event = "dirty_dir_delete_failed", ptr = %ptr, error = %err);
            }
        }
        st.dirty_dirs.clear();
        st.dirty_root_dir_entry = None;
    }

    pub(crate) fn path_for_block_write_locked(
        &self,
        _st: &LockedState,
        node: Node,
    ) -> Result<FolderPath> {
        let path = self.node_cache.path_from_node(node);
        if !path.is_valid() {
            return Err(EngineError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(path)
    }

    pub(crate) fn now_unix_nanos(&self) -> i64 {
        self.config.clock.now_unix_nanos()
    }
}

struct ReadNotifyGuard<'a> {
    reporter: &'a dyn Reporter,
    path: &'a FolderPath,
}

impl Drop for ReadNotifyGuard<'_> {
    fn drop(&mut self) {
        self.reporter.notify_read(self.path, true);
    }
}

/// Bracket a dirty operation in the journal, closing on all exits.
pub(crate) struct JournalGuard {
    journal: Option<Arc<dyn DirtyOpJournal>>,
    tlf: TlfId,
}

impl JournalGuard {
    pub(crate) fn begin(config: &EngineConfig, tlf: TlfId) -> Self {
        if let Some(journal) = &config.journal {
            journal.dirty_op_start(tlf);
            return Self {
                journal: Some(Arc::clone(journal)),
                tlf,
            };
        }
        Self { journal: None, tlf }
    }
}

impl Drop for JournalGuard {
    fn drop(&mut self) {
        if let Some(journal) = &self.journal {
            journal.dirty_op_end(self.tlf);
        }
    }
}

