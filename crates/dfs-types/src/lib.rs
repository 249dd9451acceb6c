#![forbid(unsafe_code)]
//! Core data model for DriftFS.
//!
//! Identifier newtypes, block pointers and references, directory entries,
//! folder paths, change operations, and folder metadata.  Everything here
//! is serde-serializable so deep-copy-via-serialize works uniformly.

use serde::{Deserialize, Serialize};
use std::fmt;

mod block;
mod md;
mod ops;
mod path;

pub use block::{Block, BlockShape, CommonBlock, DirBlock, FileBlock, IndirectDirPtr,
                IndirectFilePtr};
pub use md::{FolderMetadata, FolderOp, MergeStatus};
pub use ops::{AttrChange, BlockUpdate, RenameOp, SetAttrOp, SyncOp, WriteRange,
              collapse_write_ranges};
pub use path::{BranchName, FolderBranch, FolderPath, PathNode};

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Content-addressed block identifier.
///
/// Permanent IDs are the hash of the encoded block; temporary IDs are random
/// and only ever live in local caches.  The all-zero ID is the null value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         Default)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    pub const NULL: Self = Self([0; 32]);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::NULL
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First eight bytes are plenty for logs.
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Secondary identifier distinguishing different references to the same
/// underlying cipher block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         Default)]
pub struct RefNonce(pub [u8; 8]);

impl RefNonce {
    pub const ZERO: Self = Self([0; 8]);
}

impl fmt::Display for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Key generation under which a block was encrypted.  Generations start at
/// 1; 0 marks an uninitialized pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         Default)]
pub struct KeyGen(pub u32);

impl KeyGen {
    pub const FIRST: Self = Self(1);
}

/// On-the-wire data layout version of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         Default)]
pub struct DataVer(pub u32);

impl DataVer {
    pub const FIRST: Self = Self(1);
    /// Files containing unmaterialized holes require this version.
    pub const FILES_WITH_HOLES: Self = Self(2);
}

/// Cryptographically isolated top-level folder identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         Default)]
pub struct TlfId(pub u128);

impl TlfId {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// User or team identity charged for block usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         Default)]
pub struct UserId(pub u64);

impl UserId {
    pub const NIL: Self = Self(0);

    #[must_use]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

// ── Block pointers ──────────────────────────────────────────────────────────

/// Whether a pointer addresses a leaf block or an indirect block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BlockDirectType {
    #[default]
    Direct,
    Indirect,
}

/// Usage class recorded in a block's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BlockUsage {
    #[default]
    Data,
    Archive,
}

/// Creator identity and usage class attached to every block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct BlockContext {
    pub creator: UserId,
    pub usage: BlockUsage,
}

/// The primary key for a block.
///
/// Two pointers are equal iff all fields match; use [`BlockPointer::as_ref`]
/// for the (id, ref-nonce) identity that survives pointer updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub direct_type: BlockDirectType,
    pub ref_nonce: RefNonce,
    pub context: BlockContext,
}

impl BlockPointer {
    /// True once the pointer carries a real block ID.
    #[must_use]
    pub fn is_initialized(self) -> bool {
        self.id.is_valid()
    }

    /// True when the pointer is fully populated and safe to dereference.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.is_initialized() && self.key_gen >= KeyGen::FIRST && self.data_ver >= DataVer::FIRST
    }

    /// The (id, ref-nonce) pair identifying this reference across pointer
    /// updates.
    #[must_use]
    pub fn as_ref(self) -> BlockRef {
        BlockRef {
            id: self.id,
            ref_nonce: self.ref_nonce,
        }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ref_nonce == RefNonce::ZERO {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}:{}", self.id, self.ref_nonce)
        }
    }
}

/// Identity of a block reference: the ID plus the ref-nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct BlockRef {
    pub id: BlockId,
    pub ref_nonce: RefNonce,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.ref_nonce)
    }
}

/// A pointer paired with the size of its encoded (ciphertext) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Kind of object a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EntryType {
    #[default]
    File,
    Exec,
    Dir,
    Sym,
}

/// Caller-visible portion of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntryInfo {
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub sym_path: Option<String>,
}

/// A directory entry: block info plus POSIX-ish attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub sym_path: Option<String>,
}

impl DirEntry {
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.info.ptr.is_initialized()
    }

    #[must_use]
    pub fn block_ref(&self) -> BlockRef {
        self.info.ptr.as_ref()
    }

    #[must_use]
    pub fn entry_info(&self) -> EntryInfo {
        EntryInfo {
            entry_type: self.entry_type,
            size: self.size,
            mtime: self.mtime,
            ctime: self.ctime,
            sym_path: self.sym_path.clone(),
        }
    }
}
