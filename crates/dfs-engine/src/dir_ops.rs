//! Directory cache mutations.
//!
//! Every mutating operation returns an undo closure; callers compose
//! higher-level sequences (rename is remove-replacement, add-new,
//! remove-old, node-move) and abort by invoking the undos in reverse.
//! Undo closures run under the block lock and apply exactly once.

use crate::state::LockedState;
use crate::{FolderBlocks, LockState};
use asupersync::Cx;
use dfs_error::{EngineError, Result};
use dfs_types::{AttrChange, BlockInfo, BlockPointer, DirEntry, EntryType, FolderMetadata,
                FolderPath, RenameOp, SetAttrOp, UserId};
use tracing::warn;

pub(crate) type UndoFn = Box<dyn FnOnce(&FolderBlocks, &Cx, &mut LockedState) + Send>;

/// Opaque rollback handle for a directory cache mutation.
pub struct DirCacheUndo {
    inner: Option<UndoFn>,
}

impl DirCacheUndo {
    pub(crate) fn new(f: UndoFn) -> Self {
        Self { inner: Some(f) }
    }
}

impl FolderBlocks {
    /// Apply a previously returned undo, rolling the cached directory
    /// state back to its pre-mutation snapshot.
    pub fn undo_dir_cache(&self, cx: &Cx, ls: &LockState, mut undo: DirCacheUndo) {
        if let Some(f) = undo.inner.take() {
            let mut wg = self.lock.write(ls);
            f(self, cx, &mut wg);
        }
    }

    /// Track a directory block's pending unrefs, returning the inverse.
    pub(crate) fn make_dir_dirty_locked(
        &self,
        st: &mut LockedState,
        ptr: BlockPointer,
        unrefs: Vec<BlockInfo>,
    ) -> UndoFn {
        let old = st.dirty_dirs.get(&ptr).cloned();
        st.dirty_dirs.entry(ptr).or_default().extend(unrefs.iter().copied());
        Box::new(move |eng, _cx, st| {
            match old {
                Some(old_unrefs) => {
                    st.dirty_dirs.insert(ptr, old_unrefs);
                }
                None => {
                    let _ = eng.config.dirty_bcache.delete(eng.id(), ptr, eng.branch());
                    st.dirty_dirs.remove(&ptr);
                }
            }
            for unref in &unrefs {
                let _ = eng
                    .config
                    .dirty_bcache
                    .delete(eng.id(), unref.ptr, eng.branch());
            }
        })
    }

    /// Stamp the mtime/ctime of `dir` in its own parent (or the root
    /// shadow entry when `dir` is the folder root).
    pub(crate) fn update_parent_dir_entry_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        dir: &FolderPath,
        set_mtime: bool,
        set_ctime: bool,
    ) -> Result<UndoFn> {
        let now = self.now_unix_nanos();
        let pp = dir.parent_path();
        if pp.is_valid() {
            let charged_to = self.charged_to(cx)?;
            let name = dir.tail_name().to_owned();
            let (old_de, unrefs) = {
                let mut dd = self.dir_data_write(md, &pp, charged_to);
                let old_de = dd.lookup(cx, &name)?;
                let mut new_de = old_de.clone();
                if set_mtime {
                    new_de.mtime = now;
                }
                if set_ctime {
                    new_de.ctime = now;
                }
                let unrefs = dd.update_entry(cx, &name, new_de)?;
                (old_de, unrefs)
            };
            let undo_dirty = self.make_dir_dirty_locked(st, pp.tail_pointer(), unrefs);
            let md = md.clone();
            return Ok(Box::new(move |eng, cx, st| {
                let mut dd = eng.dir_data_write(&md, &pp, UserId::NIL);
                if let Err(err) = dd.update_entry(cx, &name, old_de) {
                    warn!(event = "parent_entry_undo_failed", error = %err);
                }
                undo_dirty(eng, cx, st);
            }));
        }

        // The directory is the folder root; mutate the shadow entry.
        let old = st.dirty_root_dir_entry.clone();
        let mut de = old.clone().unwrap_or_else(|| md.root_dir_entry());
        if set_mtime {
            de.mtime = now;
        }
        if set_ctime {
            de.ctime = now;
        }
        st.dirty_root_dir_entry = Some(de);
        Ok(Box::new(move |_eng, _cx, st| {
            st.dirty_root_dir_entry = old;
        }))
    }

    pub(crate) fn add_dir_entry_in_cache_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        dir: &FolderPath,
        new_name: &str,
        new_de: DirEntry,
    ) -> Result<UndoFn> {
        let charged_to = self.charged_to(cx)?;
        let unrefs = {
            let mut dd = self.dir_data_write(md, dir, charged_to);
            dd.add_entry(cx, new_name, new_de)?
        };
        let parent_undo =
            match self.update_parent_dir_entry_locked(cx, st, md, dir, true, true) {
                Ok(undo) => undo,
                Err(err) => {
                    let mut dd = self.dir_data_write(md, dir, charged_to);
                    let _ = dd.remove_entry(cx, new_name);
                    return Err(err);
                }
            };
        let undo_dirty = self.make_dir_dirty_locked(st, dir.tail_pointer(), unrefs);
        let md = md.clone();
        let dir = dir.clone();
        let name = new_name.to_owned();
        Ok(Box::new(move |eng, cx, st| {
            let mut dd = eng.dir_data_write(&md, &dir, UserId::NIL);
            if let Err(err) = dd.remove_entry(cx, &name) {
                warn!(event = "add_entry_undo_failed", error = %err);
            }
            undo_dirty(eng, cx, st);
            parent_undo(eng, cx, st);
        }))
    }

    /// Remove an entry.  `unlink_removed` is false when the entry is being
    /// moved rather than deleted, so its node survives.
    pub(crate) fn remove_dir_entry_in_cache_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        dir: &FolderPath,
        old_name: &str,
        old_de: DirEntry,
        unlink_removed: bool,
    ) -> Result<UndoFn> {
        let charged_to = self.charged_to(cx)?;
        let mut unrefs = {
            let mut dd = self.dir_data_write(md, dir, charged_to);
            dd.remove_entry(cx, old_name)?
        };
        if old_de.entry_type == EntryType::Dir {
            // The parent inherits any dirty unrefs from the removed child.
            if let Some(child_unrefs) = st.dirty_dirs.get(&old_de.info.ptr) {
                unrefs.extend(child_unrefs.iter().copied());
            }
        }

        let unlink_undo = if unlink_removed && old_de.is_initialized() {
            let child_path = dir.child_path(old_name, old_de.info.ptr);
            Some(
                self.node_cache
                    .unlink(old_de.block_ref(), &child_path, old_de.clone()),
            )
        } else {
            None
        };

        let parent_undo = match self.update_parent_dir_entry_locked(cx, st, md, dir, true, true)
        {
            Ok(undo) => undo,
            Err(err) => {
                if let Some(nc_undo) = unlink_undo {
                    self.node_cache.apply_undo(nc_undo);
                }
                let mut dd = self.dir_data_write(md, dir, charged_to);
                let _ = dd.add_entry(cx, old_name, old_de);
                return Err(err);
            }
        };

        let undo_dirty = self.make_dir_dirty_locked(st, dir.tail_pointer(), unrefs);
        let md = md.clone();
        let dir = dir.clone();
        let name = old_name.to_owned();
        Ok(Box::new(move |eng, cx, st| {
            let mut dd = eng.dir_data_write(&md, &dir, UserId::NIL);
            if let Err(err) = dd.add_entry(cx, &name, old_de) {
                warn!(event = "remove_entry_undo_failed", error = %err);
            }
            undo_dirty(eng, cx, st);
            parent_undo(eng, cx, st);
            if let Some(nc_undo) = unlink_undo {
                eng.node_cache.apply_undo(nc_undo);
            }
        }))
    }

    /// Add a brand new entry to the directory, stamping its times.
    pub fn add_dir_entry_in_cache(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: &FolderPath,
        new_name: &str,
        new_de: DirEntry,
    ) -> Result<DirCacheUndo> {
        let mut wg = self.lock.write(ls);
        let undo = self.add_dir_entry_in_cache_locked(cx, &mut wg, md, dir, new_name, new_de)?;
        Ok(DirCacheUndo::new(undo))
    }

    /// Remove an entry from the directory, stamping its times and
    /// unlinking the removed node.
    pub fn remove_dir_entry_in_cache(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        dir: &FolderPath,
        old_name: &str,
        old_de: DirEntry,
    ) -> Result<DirCacheUndo> {
        let mut wg = self.lock.write(ls);
        let undo = self.remove_dir_entry_in_cache_locked(
            cx, &mut wg, md, dir, old_name, old_de, true,
        )?;
        Ok(DirCacheUndo::new(undo))
    }

    /// Rename an entry between (possibly identical) parents, atomically
    /// with respect to the block lock.  A rename onto itself is a no-op
    /// returning no undo.
    #[allow(clippy::too_many_arguments)]
    pub fn rename_dir_entry_in_cache(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        old_parent: &FolderPath,
        old_name: &str,
        new_parent: &FolderPath,
        new_name: &str,
        new_de: DirEntry,
        replaced_de: DirEntry,
    ) -> Result<Option<DirCacheUndo>> {
        let mut wg = self.lock.write(ls);
        if new_parent.tail_pointer() == old_parent.tail_pointer() && old_name == new_name {
            return Ok(None);
        }
        let st: &mut LockedState = &mut wg;

        let undo_replace = if replaced_de.is_initialized() {
            Some(self.remove_dir_entry_in_cache_locked(
                cx, st, md, new_parent, new_name, replaced_de, true,
            )?)
        } else {
            None
        };

        let undo_add = match self.add_dir_entry_in_cache_locked(
            cx, st, md, new_parent, new_name, new_de.clone(),
        ) {
            Ok(undo) => undo,
            Err(err) => {
                if let Some(undo) = undo_replace {
                    undo(self, cx, st);
                }
                return Err(err);
            }
        };

        let undo_rm = match self.remove_dir_entry_in_cache_locked(
            cx,
            st,
            md,
            old_parent,
            old_name,
            new_de.clone(),
            false,
        ) {
            Ok(undo) => undo,
            Err(err) => {
                undo_add(self, cx, st);
                if let Some(undo) = undo_replace {
                    undo(self, cx, st);
                }
                return Err(err);
            }
        };

        let new_parent_node = self.node_cache.get(new_parent.tail_ref());
        let undo_move = match self
            .node_cache
            .move_node(new_de.block_ref(), new_parent_node, new_name)
        {
            Ok(undo) => undo,
            Err(err) => {
                undo_rm(self, cx, st);
                undo_add(self, cx, st);
                if let Some(undo) = undo_replace {
                    undo(self, cx, st);
                }
                return Err(err);
            }
        };

        Ok(Some(DirCacheUndo::new(Box::new(move |eng, cx, st| {
            eng.node_cache.apply_undo(undo_move);
            undo_rm(eng, cx, st);
            undo_add(eng, cx, st);
            if let Some(undo) = undo_replace {
                undo(eng, cx, st);
            }
        }))))
    }

    pub(crate) fn set_cached_attr_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        dir: &FolderPath,
        name: &str,
        attr: AttrChange,
        real_entry: &DirEntry,
    ) -> Result<UndoFn> {
        if !dir.is_valid() {
            // Attributes cannot be set directly on the root entry.
            return Err(EngineError::InvalidPath {
                path: dir.to_string(),
            });
        }
        let charged_to = self.charged_to(cx)?;
        let looked_up = {
            let mut dd = self.dir_data_write(md, dir, charged_to);
            dd.lookup(cx, name)
        };
        let (mut de, unlinked_node) = match looked_up {
            Ok(de) => (de, None),
            Err(EngineError::NoSuchName { .. }) => {
                let node = self
                    .node_cache
                    .get(real_entry.block_ref())
                    .filter(|n| self.node_cache.is_unlinked(*n))
                    .ok_or_else(|| EngineError::NoSuchName {
                        name: name.to_owned(),
                    })?;
                (self.node_cache.unlinked_dir_entry(node), Some(node))
            }
            Err(err) => return Err(err),
        };

        let old_de = de.clone();
        match attr {
            AttrChange::Exec => de.entry_type = real_entry.entry_type,
            AttrChange::Mtime => de.mtime = real_entry.mtime,
        }
        de.ctime = real_entry.ctime;

        if let Some(node) = unlinked_node {
            self.node_cache.update_unlinked_dir_entry(node, de);
            return Ok(Box::new(move |eng, _cx, _st| {
                eng.node_cache.update_unlinked_dir_entry(node, old_de);
            }));
        }

        let unrefs = {
            let mut dd = self.dir_data_write(md, dir, charged_to);
            dd.update_entry(cx, name, de)?
        };
        let undo_dirty = self.make_dir_dirty_locked(st, dir.tail_pointer(), unrefs);
        let md = md.clone();
        let dir = dir.clone();
        let name = name.to_owned();
        Ok(Box::new(move |eng, cx, st| {
            let mut dd = eng.dir_data_write(&md, &dir, UserId::NIL);
            if let Err(err) = dd.update_entry(cx, &name, old_de) {
                warn!(event = "setattr_undo_failed", error = %err);
            }
            undo_dirty(eng, cx, st);
        }))
    }

    /// Update an entry's cached attributes.
    pub fn set_attr_in_dir_entry_in_cache(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        p: &FolderPath,
        new_de: DirEntry,
        attr: AttrChange,
    ) -> Result<DirCacheUndo> {
        let mut wg = self.lock.write(ls);
        let undo = self.set_cached_attr_locked(
            cx,
            &mut wg,
            md,
            &p.parent_path(),
            p.tail_name(),
            attr,
            &new_de,
        )?;
        Ok(DirCacheUndo::new(undo))
    }

    /// Update the cached entry of an unlinked file per the given op,
    /// assuming a later sync of the open handle clears it out.
    pub fn update_cached_entry_attributes_on_removed_file(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        op: &SetAttrOp,
        p: &FolderPath,
        de: DirEntry,
    ) -> Result<()> {
        let mut wg = self.lock.write(ls);
        let _ = self.set_cached_attr_locked(
            cx,
            &mut wg,
            md,
            &p.parent_path(),
            p.tail_name(),
            op.attr,
            &de,
        )?;
        Ok(())
    }

    /// Prepare a rename: the current entry, the entry it would replace,
    /// and the rename op with self-updates for both parents.
    pub fn prep_rename(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
        old_parent: &FolderPath,
        old_name: &str,
        new_parent: &FolderPath,
        new_name: &str,
    ) -> Result<(DirEntry, DirEntry, RenameOp)> {
        let mut rg = self.lock.read(ls);

        let new_de = self.get_entry_read(
            cx,
            &mut rg,
            md,
            &old_parent.child_path_no_ptr(old_name),
            false,
        )?;

        let old_parent_ptr = old_parent.tail_pointer();
        let new_parent_ptr = new_parent.tail_pointer();
        let mut ro = RenameOp::new(
            old_name,
            old_parent_ptr,
            new_name,
            new_parent_ptr,
            new_de.info.ptr,
            new_de.entry_type,
        );
        ro.add_update(old_parent_ptr, old_parent_ptr);
        ro.final_path = Some(new_parent.clone());
        ro.old_final_path = Some(old_parent.clone());
        if old_parent_ptr.id != new_parent_ptr.id {
            ro.add_update(new_parent_ptr, new_parent_ptr);
        }

        let replaced_de = match self.get_entry_read(
            cx,
            &mut rg,
            md,
            &new_parent.child_path_no_ptr(new_name),
            false,
        ) {
            Ok(de) => de,
            Err(EngineError::NoSuchName { .. }) => DirEntry::default(),
            Err(err) => return Err(err),
        };

        Ok((new_de, replaced_de, ro))
    }

    /// Update the entry for `file` in its parent directory (or the
    /// unlinked-entry store when the file was removed while open).
    pub(crate) fn update_entry_locked(
        &self,
        cx: &Cx,
        st: &mut LockedState,
        md: &FolderMetadata,
        file: &FolderPath,
        de: DirEntry,
        include_deleted: bool,
    ) -> Result<()> {
        let charged_to = self.charged_to(cx)?;
        let parent = file.parent_path();
        let updated = {
            let mut dd = self.dir_data_write(md, &parent, charged_to);
            dd.update_entry(cx, file.tail_name(), de.clone())
        };
        match updated {
            Ok(unrefs) => {
                let _ = self.make_dir_dirty_locked(st, parent.tail_pointer(), unrefs);
                Ok(())
            }
            Err(EngineError::NoSuchName { name }) if include_deleted => {
                if let Some(node) = self
                    .node_cache
                    .get(file.tail_ref())
                    .filter(|n| self.node_cache.is_unlinked(*n))
                {
                    self.node_cache.update_unlinked_dir_entry(node, de);
                    return Ok(());
                }
                Err(EngineError::NoSuchName { name })
            }
            Err(err) => Err(err),
        }
    }

    /// Entry lookup for write-locked paths, including the root shadow.
    pub(crate) fn get_entry_write_locked(
        &self,
        cx: &Cx,
        st: &LockedState,
        md: &FolderMetadata,
        file: &FolderPath,
        include_deleted: bool,
    ) -> Result<DirEntry> {
        if !file.has_valid_parent() {
            if let Some(de) = st.dirty_root_dir_entry.clone() {
                return Ok(de);
            }
            return Ok(md.root_dir_entry());
        }
        let parent = file.parent_path();
        let looked_up = {
            let mut dd = self.dir_data_write(md, &parent, UserId::NIL);
            dd.lookup(cx, file.tail_name())
        };
        self.entry_or_unlinked(looked_up, file, include_deleted)
    }
}
