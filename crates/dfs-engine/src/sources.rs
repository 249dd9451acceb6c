//! Block sources binding the data adapters to the engine's caches.
//!
//! The live sources route reads through the dirty-then-clean fetch path
//! and dirtied blocks into the dirty cache; the scratch sources copy into
//! a local cache instead, leaving the live caches untouched during sync
//! staging and deep copies.

use crate::FolderBlocks;
use crate::dir_data::DirBlockSource;
use crate::file_data::FileBlockSource;
use crate::lock::{BlockReqType, ReadLockCtx};
use crate::state::LockedState;
use asupersync::Cx;
use dfs_block::LocalBlockCache;
use dfs_error::Result;
use dfs_types::{Block, BlockPointer, DirBlock, FileBlock, FolderMetadata, FolderPath};

/// File blocks for write-locked mutation paths.
pub(crate) struct WriteFileSource<'e, 's, 'p> {
    pub eng: &'e FolderBlocks,
    pub st: &'s mut LockedState,
    pub md: &'e FolderMetadata,
    pub file: &'p FolderPath,
}

impl FileBlockSource for WriteFileSource<'_, '_, '_> {
    fn get_file_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        _kind: BlockReqType,
    ) -> Result<(FileBlock, bool)> {
        self.eng
            .get_file_block_no_unlock(cx, self.md, ptr, self.file)
    }

    fn cache_dirty(&mut self, ptr: BlockPointer, block: &FileBlock) -> Result<()> {
        self.eng
            .cache_file_block_locked(self.st, ptr, self.file, block)
    }
}

/// File blocks for read-locked paths; never caches.
pub(crate) struct ReadFileSource<'e, 'l, 'g, 'p> {
    pub eng: &'e FolderBlocks,
    pub rg: &'g mut ReadLockCtx<'l>,
    pub md: &'e FolderMetadata,
    pub file: &'p FolderPath,
}

impl FileBlockSource for ReadFileSource<'_, '_, '_, '_> {
    fn get_file_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        kind: BlockReqType,
    ) -> Result<(FileBlock, bool)> {
        self.eng
            .get_file_block_read(cx, self.rg, self.md, ptr, self.file, kind)
    }

    fn cache_dirty(&mut self, ptr: BlockPointer, _block: &FileBlock) -> Result<()> {
        panic!("read-only file view must not dirty block {ptr}");
    }
}

/// File blocks staged into a scratch cache; reads fall through to the
/// live caches, copies land locally.
pub(crate) struct ScratchFileSource<'e, 'l, 'g, 'p, 'b> {
    pub eng: &'e FolderBlocks,
    pub rg: &'g mut ReadLockCtx<'l>,
    pub md: &'e FolderMetadata,
    pub file: &'p FolderPath,
    pub lbc: &'b mut LocalBlockCache,
}

impl FileBlockSource for ScratchFileSource<'_, '_, '_, '_, '_> {
    fn get_file_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        kind: BlockReqType,
    ) -> Result<(FileBlock, bool)> {
        if let Some(Block::File(fb)) = self.lbc.get(ptr) {
            return Ok((fb.clone(), true));
        }
        let get_kind = match kind {
            BlockReqType::Write => BlockReqType::Read,
            other => other,
        };
        let (block, was_dirty) =
            self.eng
                .get_file_block_read(cx, self.rg, self.md, ptr, self.file, get_kind)?;
        if kind == BlockReqType::Write {
            self.lbc.put(ptr, Block::File(block.clone()));
        }
        Ok((block, was_dirty))
    }

    fn cache_dirty(&mut self, ptr: BlockPointer, block: &FileBlock) -> Result<()> {
        self.lbc.put(ptr, Block::File(block.clone()));
        Ok(())
    }
}

/// Directory blocks for write-locked mutation paths.  Dirtied blocks go
/// straight to the dirty cache; the dirty-dir registry is maintained by
/// the engine's mutation wrappers.
pub(crate) struct WriteDirSource<'e, 'p> {
    pub eng: &'e FolderBlocks,
    pub md: &'e FolderMetadata,
    pub dir: &'p FolderPath,
}

impl DirBlockSource for WriteDirSource<'_, '_> {
    fn get_dir_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        _kind: BlockReqType,
    ) -> Result<(DirBlock, bool)> {
        self.eng.get_dir_block_no_unlock(cx, self.md, ptr, self.dir)
    }

    fn cache_dirty(&mut self, ptr: BlockPointer, block: &DirBlock) -> Result<()> {
        let branch = &self.dir.folder_branch.branch;
        self.eng.config.dirty_bcache.put(
            self.dir.folder_branch.tlf,
            ptr,
            branch,
            Block::Dir(block.clone()),
        )
    }
}

/// Directory blocks for read-locked paths; never caches.
pub(crate) struct ReadDirSource<'e, 'l, 'g, 'p> {
    pub eng: &'e FolderBlocks,
    pub rg: &'g mut ReadLockCtx<'l>,
    pub md: &'e FolderMetadata,
    pub dir: &'p FolderPath,
}

impl DirBlockSource for ReadDirSource<'_, '_, '_, '_> {
    fn get_dir_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        kind: BlockReqType,
    ) -> Result<(DirBlock, bool)> {
        self.eng
            .get_dir_block_read(cx, self.rg, self.md, ptr, self.dir, kind)
    }

    fn cache_dirty(&mut self, ptr: BlockPointer, _block: &DirBlock) -> Result<()> {
        panic!("read-only directory view must not dirty block {ptr}");
    }
}

/// Directory blocks staged into a scratch cache.  Reads copy out of the
/// live caches before landing locally, so the live dirty cache is never
/// mutated while a sync is being staged.
pub(crate) struct ScratchDirSource<'e, 'l, 'g, 'p, 'b> {
    pub eng: &'e FolderBlocks,
    pub rg: &'g mut ReadLockCtx<'l>,
    pub md: &'e FolderMetadata,
    pub dir: &'p FolderPath,
    pub lbc: &'b mut LocalBlockCache,
}

impl DirBlockSource for ScratchDirSource<'_, '_, '_, '_, '_> {
    fn get_dir_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        kind: BlockReqType,
    ) -> Result<(DirBlock, bool)> {
        if let Some(Block::Dir(db)) = self.lbc.get(ptr) {
            return Ok((db.clone(), true));
        }
        let get_kind = match kind {
            BlockReqType::Write => BlockReqType::Read,
            other => other,
        };
        let (block, was_dirty) =
            self.eng
                .get_dir_block_read(cx, self.rg, self.md, ptr, self.dir, get_kind)?;
        if kind == BlockReqType::Write {
            self.lbc.put(ptr, Block::Dir(block.clone()));
        }
        Ok((block, was_dirty))
    }

    fn cache_dirty(&mut self, ptr: BlockPointer, block: &DirBlock) -> Result<()> {
        self.lbc.put(ptr, Block::Dir(block.clone()));
        Ok(())
    }
}
