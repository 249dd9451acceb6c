//! Registries guarded by the block lock.

use crate::FolderBlocks;
use crate::dirty_file::DirtyFile;
use crate::sync::SyncInfo;
use asupersync::Cx;
use dfs_block::DirtyBlockCache;
use dfs_error::Result;
use dfs_types::{BlockInfo, BlockPointer, BlockRef, DirEntry, FolderMetadata, FolderPath};
use std::collections::HashMap;
use std::sync::Arc;

/// A queued replay of a write or truncate that raced an in-flight sync.
/// Invoked against the post-sync path once the sync settles.
pub(crate) type DeferredWriteFn = Box<
    dyn FnOnce(&FolderBlocks, &Cx, &mut LockedState, &FolderMetadata, &FolderPath) -> Result<()>
        + Send
        + Sync,
>;

/// Deferred operations for one file, keyed by its tail reference.
#[derive(Default)]
pub(crate) struct DeferredState {
    pub writes: Vec<DeferredWriteFn>,
    /// Transient dirty copies made during the race, deleted before replay.
    pub dirty_deletes: Vec<BlockPointer>,
    pub wait_bytes: i64,
}

/// Everything the block lock protects.
#[derive(Default)]
pub(crate) struct LockedState {
    // Note: `deferred` holds boxed `FnOnce` closures, which do not implement
    // `Debug`; see the manual `Debug` impl below.
    /// Files with dirty blocks, keyed by tail pointer.
    pub dirty_files: HashMap<BlockPointer, DirtyFile>,
    /// Unsynced to-be-unref'd state per file reference.
    pub unref_cache: HashMap<BlockRef, SyncInfo>,
    /// Dirty directories and their pending unrefs.
    pub dirty_dirs: HashMap<BlockPointer, Vec<BlockInfo>>,
    /// Shadow of the folder root's directory entry.
    pub dirty_root_dir_entry: Option<DirEntry>,
    /// Deferred operations per file.
    pub deferred: HashMap<BlockRef, DeferredState>,
    /// Set while a mutation dirtied a block that an in-flight sync still
    /// covers; cleared before the mutating call returns.
    pub do_defer_write: bool,
}

impl std::fmt::Debug for LockedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedState")
            .field("dirty_file_keys", &self.dirty_files.keys().collect::<Vec<_>>())
            .field("unref_cache", &self.unref_cache)
            .field("dirty_dirs", &self.dirty_dirs)
            .field("dirty_root_dir_entry", &self.dirty_root_dir_entry)
            .field("deferred_keys", &self.deferred.keys().collect::<Vec<_>>())
            .field("do_defer_write", &self.do_defer_write)
            .finish()
    }
}

impl LockedState {
    pub fn get_or_create_dirty_file(
        &mut self,
        file: &FolderPath,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
    ) -> &mut DirtyFile {
        self.dirty_files
            .entry(file.tail_pointer())
            .or_insert_with(|| DirtyFile::new(file.clone(), Arc::clone(dirty_bcache)))
    }
}
