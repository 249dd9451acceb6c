//! Folder metadata.
//!
//! A snapshot of one folder revision: the root directory entry, the change
//! ops accumulated toward the next revision, and the ref/unref byte
//! accounting used for quota tracking.

use crate::ops::{BlockUpdate, RenameOp, SetAttrOp, SyncOp};
use crate::{BlockInfo, BlockPointer, DirEntry, KeyGen, TlfId, UserId};
use serde::{Deserialize, Serialize};

/// Whether a revision sits on the main history or a conflict branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MergeStatus {
    #[default]
    Merged,
    Unmerged,
}

/// A change op recorded in folder metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderOp {
    Sync(SyncOp),
    Rename(RenameOp),
    SetAttr(SetAttrOp),
}

impl FolderOp {
    #[must_use]
    pub fn refs(&self) -> &[BlockPointer] {
        match self {
            Self::Sync(op) => &op.refs,
            Self::Rename(op) => &op.refs,
            Self::SetAttr(op) => &op.refs,
        }
    }

    #[must_use]
    pub fn unrefs(&self) -> &[BlockPointer] {
        match self {
            Self::Sync(op) => &op.unrefs,
            Self::Rename(op) => &op.unrefs,
            Self::SetAttr(op) => &op.unrefs,
        }
    }

    #[must_use]
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        match self {
            Self::Sync(op) => op.all_updates(),
            Self::Rename(op) => op.all_updates(),
            Self::SetAttr(op) => {
                let mut all = Vec::new();
                if op.dir.new_ptr.is_initialized() {
                    all.push(op.dir);
                }
                all.extend_from_slice(&op.updates);
                all
            }
        }
    }

    fn add_ref(&mut self, ptr: BlockPointer) {
        match self {
            Self::Sync(op) => op.refs.push(ptr),
            Self::Rename(op) => op.refs.push(ptr),
            Self::SetAttr(op) => op.refs.push(ptr),
        }
    }

    fn add_unref(&mut self, ptr: BlockPointer) {
        match self {
            Self::Sync(op) => op.unrefs.push(ptr),
            Self::Rename(op) => op.unrefs.push(ptr),
            Self::SetAttr(op) => op.unrefs.push(ptr),
        }
    }
}

/// One folder revision's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FolderMetadata {
    pub tlf: TlfId,
    pub revision: u64,
    pub merged: MergeStatus,
    pub key_gen: KeyGen,
    pub root_entry: DirEntry,
    pub writers: Vec<UserId>,
    pub ops: Vec<FolderOp>,
    ref_bytes: u64,
    unref_bytes: u64,
    disk_usage: u64,
}

impl FolderMetadata {
    #[must_use]
    pub fn root_dir_entry(&self) -> DirEntry {
        self.root_entry.clone()
    }

    #[must_use]
    pub fn is_writer(&self, user: UserId) -> bool {
        self.writers.contains(&user)
    }

    pub fn add_op(&mut self, op: FolderOp) {
        self.ops.push(op);
    }

    /// Record a newly referenced block on the most recent op, charging its
    /// encoded size to the revision's quota accounting.
    pub fn add_ref_block(&mut self, info: BlockInfo) {
        self.ref_bytes = self.ref_bytes.saturating_add(u64::from(info.encoded_size));
        self.disk_usage = self.disk_usage.saturating_add(u64::from(info.encoded_size));
        if let Some(op) = self.ops.last_mut() {
            op.add_ref(info.ptr);
        }
    }

    /// Record a dereferenced block on the most recent op.  Pushing the same
    /// ref twice is tolerated; repeats carry a zero size.
    pub fn add_unref_block(&mut self, info: BlockInfo) {
        self.unref_bytes = self
            .unref_bytes
            .saturating_add(u64::from(info.encoded_size));
        self.disk_usage = self.disk_usage.saturating_sub(u64::from(info.encoded_size));
        if let Some(op) = self.ops.last_mut() {
            op.add_unref(info.ptr);
        }
    }

    pub fn add_update(&mut self, old_ptr: BlockPointer, new_ptr: BlockPointer) {
        match self.ops.last_mut() {
            Some(FolderOp::Sync(op)) => op.add_update(old_ptr, new_ptr),
            Some(FolderOp::Rename(op)) => op.add_update(old_ptr, new_ptr),
            Some(FolderOp::SetAttr(op)) => {
                op.updates.push(BlockUpdate { old_ptr, new_ptr });
            }
            None => {}
        }
    }

    #[must_use]
    pub fn ref_bytes(&self) -> u64 {
        self.ref_bytes
    }

    #[must_use]
    pub fn unref_bytes(&self) -> u64 {
        self.unref_bytes
    }

    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        self.disk_usage
    }

    pub fn set_ref_bytes(&mut self, bytes: u64) {
        self.ref_bytes = bytes;
    }

    pub fn set_unref_bytes(&mut self, bytes: u64) {
        self.unref_bytes = bytes;
    }

    pub fn set_disk_usage(&mut self, bytes: u64) {
        self.disk_usage = bytes;
    }

    pub fn add_disk_usage(&mut self, bytes: u64) {
        self.disk_usage = self.disk_usage.saturating_add(bytes);
    }

    /// Every pointer referenced or updated-to by this revision's ops.
    #[must_use]
    pub fn all_referenced_ptrs(&self) -> Vec<BlockPointer> {
        let mut ptrs = Vec::new();
        for op in &self.ops {
            ptrs.extend_from_slice(op.refs());
            for update in op.all_updates() {
                ptrs.push(update.new_ptr);
            }
        }
        ptrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockId, DataVer, KeyGen};

    fn ptr(b: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId([b; 32]),
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            ..BlockPointer::default()
        }
    }

    fn info(b: u8, size: u32) -> BlockInfo {
        BlockInfo {
            ptr: ptr(b),
            encoded_size: size,
        }
    }

    #[test]
    fn ref_accounting() {
        let mut md = FolderMetadata::default();
        md.add_op(FolderOp::Sync(SyncOp::new(ptr(1))));
        md.add_ref_block(info(2, 100));
        md.add_ref_block(info(3, 50));
        md.add_unref_block(info(4, 30));
        assert_eq!(md.ref_bytes(), 150);
        assert_eq!(md.unref_bytes(), 30);
        assert_eq!(md.disk_usage(), 120);

        let FolderOp::Sync(op) = &md.ops[0] else {
            panic!("expected sync op");
        };
        assert_eq!(op.refs, vec![ptr(2), ptr(3)]);
        assert_eq!(op.unrefs, vec![ptr(4)]);
    }

    #[test]
    fn referenced_ptrs_include_updates() {
        let mut md = FolderMetadata::default();
        let mut op = SyncOp::new(ptr(1));
        op.add_update(ptr(1), ptr(9));
        md.add_op(FolderOp::Sync(op));
        md.add_ref_block(info(2, 10));
        let ptrs = md.all_referenced_ptrs();
        assert!(ptrs.contains(&ptr(2)));
        assert!(ptrs.contains(&ptr(9)));
    }

    #[test]
    fn writer_check() {
        let md = FolderMetadata {
            writers: vec![UserId(1), UserId(2)],
            ..FolderMetadata::default()
        };
        assert!(md.is_writer(UserId(1)));
        assert!(!md.is_writer(UserId(3)));
    }
}
