//! Write and truncate paths.
//!
//! Both begin by reserving dirty-buffer budget, wait out any sync the
//! file is part of, and then mutate the dirty registries under the write
//! lock.  Mutations that race an in-flight sync are snapshotted and
//! replayed against the post-sync path when the sync settles.

use crate::dirty_file::SyncFailure;
use crate::file_data::WriteAcc;
use crate::state::LockedState;
use crate::{
    DEFERRED_WRITE_LOG_DELAY, FolderBlocks, JournalGuard, LockState, Node,
    TRUNCATE_EXTEND_CUTOFF,
};
use crate::lock::BlockReqType;
use asupersync::Cx;
use dfs_block::{DirtyBlockCache, DirtyPermission};
use dfs_error::{EngineError, Result};
use dfs_types::{BlockPointer, FolderMetadata, FolderPath, TlfId, WriteRange};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError, channel};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Releases a dirty-buffer reservation on every exit path.
struct UnsyncedBytesGuard {
    dirty_bcache: Arc<dyn DirtyBlockCache>,
    tlf: TlfId,
    bytes: i64,
}

impl Drop for UnsyncedBytesGuard {
    fn drop(&mut self) {
        self.dirty_bcache
            .update_unsynced_bytes(self.tlf, -self.bytes, false);
    }
}

impl FolderBlocks {
    /// Wait for the admission grant, watching the file's error listener
    /// so a fatal sync failure aborts the blocked write.  Cancellations
    /// of prior syncs are transparent: the listener is re-registered and
    /// the wait resumes.
    fn maybe_wait_on_deferred_writes(
        &self,
        cx: &Cx,
        ls: &LockState,
        file: Node,
        perm: &DirtyPermission,
    ) -> Result<()> {
        let register = |ls: &LockState| -> Result<Receiver<SyncFailure>> {
            let mut wg = self.lock.write(ls);
            let st: &mut LockedState = &mut wg;
            let file_path = self.path_for_block_write_locked(st, file)?;
            let (tx, rx) = channel();
            // Only a file that already has dirty state can have a sync in
            // flight; otherwise the sender is simply dropped and the wait
            // rides on the admission grant alone.
            if let Some(df) = st.dirty_files.get_mut(&file_path.tail_pointer()) {
                df.add_err_listener(tx);
            }
            Ok(rx)
        };
        let mut listener = register(ls)?;

        let start = Instant::now();
        let mut logged_block = false;
        loop {
            if perm.try_granted() {
                // Surface any failure that was queued while we waited.
                match listener.try_recv() {
                    Ok(SyncFailure::Cancelled) | Err(_) => return Ok(()),
                    Ok(failure @ SyncFailure::Fatal(_)) => {
                        return Err(failure
                            .into_error()
                            .unwrap_or(EngineError::Cancelled));
                    }
                }
            }
            match listener.try_recv() {
                Ok(SyncFailure::Cancelled) => {
                    // A prior sync was cancelled; that must not fail an
                    // independent write.
                    debug!(event = "ignoring_cancelled_sync_error");
                    listener = register(ls)?;
                    continue;
                }
                Ok(failure @ SyncFailure::Fatal(_)) => {
                    return Err(failure.into_error().unwrap_or(EngineError::Cancelled));
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
            cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
            if !logged_block && start.elapsed() >= DEFERRED_WRITE_LOG_DELAY {
                debug!(event = "write_blocked_on_dirty_buffer");
                logged_block = true;
            }
            let _ = perm.wait_granted_for(DEFERRED_WRITE_LOG_DELAY / 10);
        }
    }

    /// The write-locked body of `write`.  Returns the latest write range,
    /// the pointers dirtied, and the newly dirtied child bytes.
    pub(crate) fn write_data_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        file: &FolderPath,
        data: &[u8],
        off: u64,
    ) -> Result<(WriteRange, Vec<BlockPointer>, i64)> {
        let _journal = JournalGuard::begin(&self.config, self.id());
        trace!(event = "write_data", file = %file.tail_pointer(), off, len = data.len());

        self.check_write_access(cx, md, file)?;
        let charged_to = self.charged_to(cx)?;

        let de = self.get_entry_write_locked(cx, st, md, file, true)?;
        if de.info.ptr != file.tail_pointer() {
            debug!(
                event = "entry_tail_mismatch",
                entry = %de.info.ptr,
                tail = %file.tail_pointer()
            );
        }
        st.unref_cache
            .entry(file.tail_ref())
            .or_insert_with(|| crate::sync::SyncInfo::new(&de));

        let mut acc = WriteAcc::default();
        let write_result = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            fd.write(cx, data, off, &de, &mut acc)
        };

        // Byte accounting and unrefs are always applied, even on error,
        // since partially dirtied blocks stay in the cache.
        let df = st.get_or_create_dirty_file(file, &self.config.dirty_bcache);
        df.update_not_yet_syncing_bytes(acc.newly_dirtied_child_bytes);
        if self.config.dirty_bcache.should_force_sync(self.id()) {
            self.poke_force_sync();
        }
        if let Some(si) = st.unref_cache.get_mut(&file.tail_ref()) {
            si.unrefs.extend(acc.unrefs.iter().copied());
        }

        let (mut new_de, bytes_extended) = write_result?;
        let now = self.now_unix_nanos();
        new_de.mtime = now;
        new_de.ctime = now;
        self.update_entry_locked(cx, st, md, file, new_de, true)?;

        if st.do_defer_write {
            let df = st.get_or_create_dirty_file(file, &self.config.dirty_bcache);
            df.add_deferred_new_bytes(bytes_extended);
        }

        let latest = st
            .unref_cache
            .get_mut(&file.tail_ref())
            .map(|si| si.op.add_write(off, data.len() as u64))
            .unwrap_or_else(|| WriteRange::write(off, data.len() as u64));

        Ok((latest, acc.dirty_ptrs, acc.newly_dirtied_child_bytes))
    }

    fn check_write_access(
        &self,
        cx: &Cx,
        md: &FolderMetadata,
        file: &FolderPath,
    ) -> Result<()> {
        let session = self.config.sessions.current_session(cx)?;
        if !md.is_writer(session.user) {
            return Err(EngineError::WriteAccess {
                user: session.name,
                folder: file.folder_branch.tlf.to_string(),
            });
        }
        Ok(())
    }

    /// Write `data` to the file at `off`.  May block while the dirty
    /// buffer is over budget; a future sync unblocks it.
    pub fn write(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: Node,
        data: &[u8],
        off: u64,
    ) -> Result<()> {
        let bytes = data.len() as i64;
        let perm = self
            .config
            .dirty_bcache
            .request_permission_to_dirty(cx, self.id(), bytes)?;
        let _reservation = UnsyncedBytesGuard {
            dirty_bcache: Arc::clone(&self.config.dirty_bcache),
            tlf: self.id(),
            bytes,
        };
        self.maybe_wait_on_deferred_writes(cx, ls, file, &perm)?;

        let mut wg = self.lock.write(ls);
        let st: &mut LockedState = &mut wg;
        let file_path = self.path_for_block_write_locked(st, file)?;

        let result = self.write_data_locked(cx, st, md, &file_path, data, off);
        let defer_now = std::mem::take(&mut st.do_defer_write);
        let (latest, dirty_ptrs, newly_dirtied_child_bytes) = result?;

        if defer_now {
            // The write touched blocks an in-flight sync still covers;
            // replay it against the post-sync path once the sync settles.
            debug!(
                event = "deferring_write",
                file = %file_path.tail_pointer(),
                off,
                len = data.len()
            );
            let data_copy = data.to_vec();
            let old_path = file_path.clone();
            let ds = st.deferred.entry(file_path.tail_ref()).or_default();
            ds.dirty_deletes.extend(dirty_ptrs.iter().copied());
            ds.wait_bytes += newly_dirtied_child_bytes;
            ds.writes.push(Box::new(move |eng, cx, st, kmd, new_path| {
                // These bytes are about to be re-dirtied under the new
                // path, so they no longer count against the old file.
                let df = st.get_or_create_dirty_file(&old_path, &eng.config.dirty_bcache);
                df.update_not_yet_syncing_bytes(-newly_dirtied_child_bytes);
                eng.write_data_locked(cx, st, kmd, new_path, &data_copy, off)?;
                Ok(())
            }));
        }
        drop(wg);

        self.notify_local_change(file, latest);
        Ok(())
    }

    /// The write-locked body of `truncate`.
    pub(crate) fn truncate_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        file: &FolderPath,
        size: u64,
    ) -> Result<(Option<WriteRange>, Vec<BlockPointer>, i64)> {
        let _journal = JournalGuard::begin(&self.config, self.id());
        self.check_write_access(cx, md, file)?;
        let charged_to = self.charged_to(cx)?;

        // Find where the file currently ends relative to the new size.
        let (start_off, block_len, next_block_off) = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            let lookup = fd.leaf_at_offset(cx, size, BlockReqType::Write)?;
            (
                lookup.start_off,
                lookup.block.contents.len() as u64,
                lookup.next_block_off,
            )
        };
        let curr_len = start_off + block_len;

        if curr_len + TRUNCATE_EXTEND_CUTOFF < size {
            return self.truncate_extend_locked(cx, st, md, file, size);
        }
        if curr_len < size {
            // Extend within the cutoff by writing zeroes.
            let more = usize::try_from(size - curr_len).unwrap_or(usize::MAX);
            let zeroes = vec![0_u8; more];
            let (latest, dirty_ptrs, newly_dirtied) =
                self.write_data_locked(cx, st, md, file, &zeroes, curr_len)?;
            return Ok((Some(latest), dirty_ptrs, newly_dirtied));
        }
        if curr_len == size && next_block_off.is_none() {
            // Already exactly this size.
            return Ok((None, Vec::new(), 0));
        }

        // Shrink.
        let de = self.get_entry_write_locked(cx, st, md, file, true)?;
        st.unref_cache
            .entry(file.tail_ref())
            .or_insert_with(|| crate::sync::SyncInfo::new(&de));

        let mut acc = WriteAcc::default();
        let shrink_result = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            fd.truncate_shrink(cx, size, &de, &mut acc)
        };
        if let Some(si) = st.unref_cache.get_mut(&file.tail_ref()) {
            si.unrefs.extend(acc.unrefs.iter().copied());
        }
        let df = st.get_or_create_dirty_file(file, &self.config.dirty_bcache);
        df.update_not_yet_syncing_bytes(acc.newly_dirtied_child_bytes);

        let mut new_de = shrink_result?;
        let latest = st
            .unref_cache
            .get_mut(&file.tail_ref())
            .map(|si| si.op.add_truncate(size))
            .unwrap_or_else(|| WriteRange::truncate(size));
        let now = self.now_unix_nanos();
        new_de.mtime = now;
        new_de.ctime = now;
        self.update_entry_locked(cx, st, md, file, new_de, true)?;

        Ok((Some(latest), acc.dirty_ptrs, acc.newly_dirtied_child_bytes))
    }

    /// Extend the file past the hole cutoff without materializing zeroes.
    fn truncate_extend_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        file: &FolderPath,
        size: u64,
    ) -> Result<(Option<WriteRange>, Vec<BlockPointer>, i64)> {
        let charged_to = self.charged_to(cx)?;
        let de = self.get_entry_write_locked(cx, st, md, file, true)?;
        st.unref_cache
            .entry(file.tail_ref())
            .or_insert_with(|| crate::sync::SyncInfo::new(&de));

        let mut acc = WriteAcc::default();
        let extend_result = {
            let mut fd = self.file_data_write(st, md, file, charged_to);
            fd.truncate_extend(cx, size, &de, &mut acc)
        };
        let df = st.get_or_create_dirty_file(file, &self.config.dirty_bcache);
        df.update_not_yet_syncing_bytes(acc.newly_dirtied_child_bytes);

        let mut new_de = extend_result?;
        let now = self.now_unix_nanos();
        new_de.mtime = now;
        new_de.ctime = now;
        self.update_entry_locked(cx, st, md, file, new_de, true)?;

        let latest = st
            .unref_cache
            .get_mut(&file.tail_ref())
            .map(|si| si.op.add_truncate(size))
            .unwrap_or_else(|| WriteRange::truncate(size));

        if self.config.dirty_bcache.should_force_sync(self.id()) {
            self.poke_force_sync();
        }
        debug!(event = "truncate_extended_with_hole", file = %file.tail_pointer(), size);
        Ok((Some(latest), acc.dirty_ptrs, 0))
    }

    /// Truncate or extend the file to `size`.  May block while the dirty
    /// buffer is over budget.
    pub fn truncate(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        file: Node,
        size: u64,
    ) -> Result<()> {
        // Assume the whole remaining file may end up dirty.
        let bytes = i64::try_from(size).unwrap_or(i64::MAX);
        let perm = self
            .config
            .dirty_bcache
            .request_permission_to_dirty(cx, self.id(), bytes)?;
        let _reservation = UnsyncedBytesGuard {
            dirty_bcache: Arc::clone(&self.config.dirty_bcache),
            tlf: self.id(),
            bytes,
        };
        self.maybe_wait_on_deferred_writes(cx, ls, file, &perm)?;

        let mut wg = self.lock.write(ls);
        let st: &mut LockedState = &mut wg;
        let file_path = self.path_for_block_write_locked(st, file)?;

        let result = self.truncate_locked(cx, st, md, &file_path, size);
        let defer_now = std::mem::take(&mut st.do_defer_write);
        let (latest, dirty_ptrs, newly_dirtied_child_bytes) = result?;

        if defer_now {
            debug!(event = "deferring_truncate", file = %file_path.tail_pointer(), size);
            let old_path = file_path.clone();
            let ds = st.deferred.entry(file_path.tail_ref()).or_default();
            ds.dirty_deletes.extend(dirty_ptrs.iter().copied());
            ds.wait_bytes += newly_dirtied_child_bytes;
            ds.writes.push(Box::new(move |eng, cx, st, kmd, new_path| {
                let df = st.get_or_create_dirty_file(&old_path, &eng.config.dirty_bcache);
                df.update_not_yet_syncing_bytes(-newly_dirtied_child_bytes);
                eng.truncate_locked(cx, st, kmd, new_path, size)?;
                Ok(())
            }));
        }
        drop(wg);

        if self.config.dirty_bcache.should_force_sync(self.id()) {
            self.poke_force_sync();
        }
        if let Some(latest) = latest {
            self.notify_local_change(file, latest);
        }
        Ok(())
    }

    /// Replay any writes or truncates deferred while a sync was in
    /// flight, against the post-sync path.
    pub(crate) fn do_deferred_writes_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        old_path: &FolderPath,
        new_path: &FolderPath,
    ) -> Result<bool> {
        let Some(ds) = st.deferred.remove(&old_path.tail_ref()) else {
            return Ok(false);
        };
        let still_dirty = !ds.writes.is_empty();

        // Drop the transient dirty copies made during the race before
        // replaying on top of the new blocks.
        for ptr in &ds.dirty_deletes {
            debug!(event = "deleting_deferred_dirty_ptr", ptr = %ptr);
            self.config.dirty_bcache.delete(self.id(), *ptr, self.branch())?;
        }
        for write in ds.writes {
            if let Err(err) = write(self, cx, st, md, new_path) {
                warn!(event = "deferred_replay_failed", error = %err);
                return Err(err);
            }
        }
        Ok(still_dirty)
    }
}
