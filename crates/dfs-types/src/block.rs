//! Block variants.
//!
//! A file block is either direct (raw bytes) or indirect (an ordered list
//! of child pointers with byte offsets).  A directory block is either
//! direct (name to entry map) or indirect (children partitioned by starting
//! name).  Cloning a block is a deep copy; every copy-on-write mutation
//! must operate on a clone.

use crate::{BlockInfo, DataVer, DirEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Child pointer inside an indirect file block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    /// Byte offset of the first byte covered by this child.
    pub off: u64,
    /// True when unmaterialized holes may precede this child.
    pub holes: bool,
}

/// Child pointer inside an indirect directory block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectDirPtr {
    pub info: BlockInfo,
    /// Smallest entry name covered by this child.
    pub off: String,
}

/// A block of file data, direct or indirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileBlock {
    pub contents: Vec<u8>,
    pub iptrs: Vec<IndirectFilePtr>,
    pub is_indirect: bool,
}

impl FileBlock {
    #[must_use]
    pub fn new_direct(contents: Vec<u8>) -> Self {
        Self {
            contents,
            iptrs: Vec::new(),
            is_indirect: false,
        }
    }

    #[must_use]
    pub fn new_indirect(iptrs: Vec<IndirectFilePtr>) -> Self {
        Self {
            contents: Vec::new(),
            iptrs,
            is_indirect: true,
        }
    }

    /// The data version this block requires on the wire.
    #[must_use]
    pub fn data_version(&self) -> DataVer {
        if self.is_indirect && self.iptrs.iter().any(|p| p.holes) {
            DataVer::FILES_WITH_HOLES
        } else {
            DataVer::FIRST
        }
    }
}

/// A block of directory entries, direct or indirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirBlock {
    pub children: BTreeMap<String, DirEntry>,
    pub iptrs: Vec<IndirectDirPtr>,
    pub is_indirect: bool,
}

impl DirBlock {
    #[must_use]
    pub fn new_direct() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn data_version(&self) -> DataVer {
        DataVer::FIRST
    }
}

/// Placeholder for blocks fetched without knowing their shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommonBlock {
    pub is_indirect: bool,
}

/// Shape requested when allocating an empty block for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    File,
    Dir,
    Common,
}

/// Polymorphic block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
    Common(CommonBlock),
}

impl Block {
    /// An empty block of the given shape.
    #[must_use]
    pub fn new_empty(shape: BlockShape) -> Self {
        match shape {
            BlockShape::File => Self::File(FileBlock::default()),
            BlockShape::Dir => Self::Dir(DirBlock::default()),
            BlockShape::Common => Self::Common(CommonBlock::default()),
        }
    }

    #[must_use]
    pub fn is_indirect(&self) -> bool {
        match self {
            Self::File(b) => b.is_indirect,
            Self::Dir(b) => b.is_indirect,
            Self::Common(b) => b.is_indirect,
        }
    }

    #[must_use]
    pub fn data_version(&self) -> DataVer {
        match self {
            Self::File(b) => b.data_version(),
            Self::Dir(b) => b.data_version(),
            Self::Common(_) => DataVer::FIRST,
        }
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&FileBlock> {
        match self {
            Self::File(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dir(&self) -> Option<&DirBlock> {
        match self {
            Self::Dir(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_file(self) -> Option<FileBlock> {
        match self {
            Self::File(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_dir(self) -> Option<DirBlock> {
        match self {
            Self::Dir(b) => Some(b),
            _ => None,
        }
    }
}

impl From<FileBlock> for Block {
    fn from(b: FileBlock) -> Self {
        Self::File(b)
    }
}

impl From<DirBlock> for Block {
    fn from(b: DirBlock) -> Self {
        Self::Dir(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockId, BlockPointer, KeyGen};

    #[test]
    fn data_version_tracks_holes() {
        let plain = FileBlock::new_direct(b"abc".to_vec());
        assert_eq!(plain.data_version(), DataVer::FIRST);

        let ind = FileBlock::new_indirect(vec![IndirectFilePtr {
            info: BlockInfo::default(),
            off: 0,
            holes: false,
        }]);
        assert_eq!(ind.data_version(), DataVer::FIRST);

        let holey = FileBlock::new_indirect(vec![IndirectFilePtr {
            info: BlockInfo::default(),
            off: 4096,
            holes: true,
        }]);
        assert_eq!(holey.data_version(), DataVer::FILES_WITH_HOLES);
    }

    #[test]
    fn clone_is_deep() {
        let mut a = FileBlock::new_direct(b"hello".to_vec());
        let b = a.clone();
        a.contents[0] = b'x';
        assert_eq!(b.contents, b"hello");
    }

    #[test]
    fn downcasts() {
        let block = Block::new_empty(BlockShape::File);
        assert!(block.as_file().is_some());
        assert!(block.as_dir().is_none());
        let block = Block::new_empty(BlockShape::Dir);
        assert!(block.as_dir().is_some());
        assert!(!block.is_indirect());
    }

    #[test]
    fn serde_round_trip() {
        let mut dir = DirBlock::new_direct();
        dir.children.insert(
            "a.txt".to_owned(),
            DirEntry {
                info: BlockInfo {
                    ptr: BlockPointer {
                        id: BlockId([9; 32]),
                        key_gen: KeyGen::FIRST,
                        data_ver: DataVer::FIRST,
                        ..BlockPointer::default()
                    },
                    encoded_size: 12,
                },
                size: 5,
                ..DirEntry::default()
            },
        );
        let block = Block::Dir(dir.clone());
        let bytes = serde_json::to_vec(&block).unwrap();
        let back: Block = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.as_dir().unwrap(), &dir);
    }
}
