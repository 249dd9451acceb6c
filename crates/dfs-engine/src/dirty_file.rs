//! Per-file dirty block state.
//!
//! Tracks which of a file's blocks are dirty, which are in flight to the
//! block store, and which old pointers have been orphaned by a sync, plus
//! the byte accounting that feeds the dirty cache's admission control and
//! the error listeners that let blocked writers learn about sync failures.

use dfs_block::DirtyBlockCache;
use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockPointer, FolderPath};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use tracing::{debug, trace};

/// Sync outcome delivered to blocked writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncFailure {
    /// The sync's context was cancelled; an independent write may retry.
    Cancelled,
    /// The sync failed for good; the write should give up.
    Fatal(String),
}

impl SyncFailure {
    pub fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::Cancelled => Self::Cancelled,
            other => Self::Fatal(other.to_string()),
        }
    }

    pub fn into_error(self) -> Option<EngineError> {
        match self {
            Self::Cancelled => None,
            Self::Fatal(msg) => Some(EngineError::BlockStore(msg)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirtyFileBlockState {
    /// Dirty, not part of any in-flight sync.
    Dirty,
    /// Dirty and currently being written to the block store.
    Syncing,
    /// Superseded by a permanent ID during the current sync; its bytes may
    /// be reclaimed when the sync settles.
    Orphaned,
}

/// State for one file with dirty blocks, keyed by its tail pointer.
pub(crate) struct DirtyFile {
    file: FolderPath,
    dirty_bcache: Arc<dyn DirtyBlockCache>,
    states: HashMap<BlockPointer, DirtyFileBlockState>,
    not_yet_syncing_bytes: i64,
    total_sync_bytes: i64,
    deferred_new_bytes: i64,
    err_listeners: Vec<Sender<SyncFailure>>,
}

impl DirtyFile {
    pub fn new(file: FolderPath, dirty_bcache: Arc<dyn DirtyBlockCache>) -> Self {
        Self {
            file,
            dirty_bcache,
            states: HashMap::new(),
            not_yet_syncing_bytes: 0,
            total_sync_bytes: 0,
            deferred_new_bytes: 0,
            err_listeners: Vec::new(),
        }
    }

    /// Mark a block dirty.  Returns whether the pointer was newly tracked
    /// and whether an in-flight sync still covers it (in which case the
    /// caller must defer the triggering write).
    pub fn set_block_dirty(&mut self, ptr: BlockPointer) -> (bool, bool) {
        match self.states.get(&ptr) {
            None => {
                self.states.insert(ptr, DirtyFileBlockState::Dirty);
                (true, false)
            }
            Some(DirtyFileBlockState::Dirty) => (false, false),
            Some(DirtyFileBlockState::Syncing | DirtyFileBlockState::Orphaned) => (false, true),
        }
    }

    /// True when a writer must take a fresh copy before mutating the block
    /// under this pointer.
    pub fn block_needs_copy(&self, ptr: BlockPointer) -> bool {
        matches!(
            self.states.get(&ptr),
            Some(DirtyFileBlockState::Syncing | DirtyFileBlockState::Orphaned)
        )
    }

    /// Transition a dirty block into the in-flight state, charging its
    /// bytes to the sync.
    pub fn set_block_syncing(&mut self, ptr: BlockPointer) -> Result<()> {
        match self.states.get_mut(&ptr) {
            None => Err(EngineError::BlockStore(format!(
                "block {ptr} is not dirty and cannot start syncing"
            ))),
            Some(state) => {
                *state = DirtyFileBlockState::Syncing;
                let bytes = self.dirty_block_size(ptr);
                self.total_sync_bytes += bytes;
                let tlf = self.file.folder_branch.tlf;
                self.dirty_bcache.update_syncing_bytes(tlf, bytes);
                trace!(event = "block_syncing", ptr = %ptr, bytes);
                Ok(())
            }
        }
    }

    pub fn set_block_orphaned(&mut self, ptr: BlockPointer, orphaned: bool) {
        if let Some(state) = self.states.get_mut(&ptr) {
            *state = if orphaned {
                DirtyFileBlockState::Orphaned
            } else {
                DirtyFileBlockState::Syncing
            };
        }
    }

    pub fn is_block_orphaned(&self, ptr: BlockPointer) -> bool {
        matches!(self.states.get(&ptr), Some(DirtyFileBlockState::Orphaned))
    }

    /// After a failed sync, in-flight blocks are merely dirty again.
    pub fn reset_syncing_blocks_to_dirty(&mut self) {
        for state in self.states.values_mut() {
            if *state == DirtyFileBlockState::Syncing {
                *state = DirtyFileBlockState::Dirty;
            }
        }
        let tlf = self.file.folder_branch.tlf;
        self.dirty_bcache
            .update_syncing_bytes(tlf, -self.total_sync_bytes);
        self.total_sync_bytes = 0;
    }

    /// Adjust the count of dirty bytes not yet covered by a sync, mirroring
    /// the change into the system-wide dirty cache accounting.
    pub fn update_not_yet_syncing_bytes(&mut self, bytes: i64) {
        self.not_yet_syncing_bytes += bytes;
        let tlf = self.file.folder_branch.tlf;
        self.dirty_bcache.update_unsynced_bytes(tlf, bytes, false);
    }

    /// Bytes of file extension performed while a sync was in flight.
    pub fn add_deferred_new_bytes(&mut self, bytes: u64) {
        self.deferred_new_bytes += i64::try_from(bytes).unwrap_or(i64::MAX);
    }

    /// A retried sync absorbs the deferred extension bytes.
    pub fn assimilate_deferred_new_bytes(&mut self) {
        if self.deferred_new_bytes == 0 {
            return;
        }
        debug!(
            event = "deferred_bytes_assimilated",
            bytes = self.deferred_new_bytes
        );
        self.total_sync_bytes += self.deferred_new_bytes;
        self.deferred_new_bytes = 0;
    }

    #[must_use]
    pub fn not_yet_syncing_bytes(&self) -> i64 {
        self.not_yet_syncing_bytes
    }

    /// Release the sync's byte accounting after a successful publication.
    pub fn finish_sync(&mut self) -> Result<()> {
        let tlf = self.file.folder_branch.tlf;
        self.dirty_bcache.sync_finished(tlf, self.total_sync_bytes);
        self.total_sync_bytes = 0;
        self.states.retain(|_, state| *state == DirtyFileBlockState::Dirty);
        Ok(())
    }

    pub fn add_err_listener(&mut self, listener: Sender<SyncFailure>) {
        self.err_listeners.push(listener);
    }

    /// Deliver a sync failure to every blocked writer and clear the list.
    pub fn notify_err_listeners(&mut self, failure: &SyncFailure) {
        for listener in self.err_listeners.drain(..) {
            let _ = listener.send(failure.clone());
        }
    }

    fn dirty_block_size(&self, ptr: BlockPointer) -> i64 {
        let tlf = self.file.folder_branch.tlf;
        match self
            .dirty_bcache
            .get(tlf, ptr, &self.file.folder_branch.branch)
        {
            Ok(Block::File(fb)) if !fb.is_indirect => {
                i64::try_from(fb.contents.len()).unwrap_or(i64::MAX)
            }
            _ => 0,
        }
    }
}
