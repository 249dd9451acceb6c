//! Folder-relative paths.
//!
//! A path is a sequence of (pointer, name) nodes from the folder root to a
//! target block, tagged with the folder and branch it belongs to.

use crate::{BlockPointer, BlockRef, TlfId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a divergent write history within a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchName(pub String);

impl BranchName {
    #[must_use]
    pub fn master() -> Self {
        Self("master".to_owned())
    }
}

impl Default for BranchName {
    fn default() -> Self {
        Self::master()
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A folder plus the branch being operated on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct FolderBranch {
    pub tlf: TlfId,
    pub branch: BranchName,
}

/// One component of a folder path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

/// A path from the folder root to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FolderPath {
    pub folder_branch: FolderBranch,
    pub nodes: Vec<PathNode>,
}

impl FolderPath {
    #[must_use]
    pub fn new(folder_branch: FolderBranch, nodes: Vec<PathNode>) -> Self {
        Self {
            folder_branch,
            nodes,
        }
    }

    /// A path is valid when it is non-empty and rooted at a real pointer.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.nodes
            .first()
            .is_some_and(|n| n.ptr.is_valid())
    }

    /// Read notifications only fire for paths inside a real folder.
    #[must_use]
    pub fn is_valid_for_notification(&self) -> bool {
        self.is_valid() && self.folder_branch.tlf.is_valid()
    }

    #[must_use]
    pub fn has_valid_parent(&self) -> bool {
        self.nodes.len() >= 2 && self.parent_path().is_valid()
    }

    /// Pointer of the last path component.
    ///
    /// Returns the default (invalid) pointer for an empty path.
    #[must_use]
    pub fn tail_pointer(&self) -> BlockPointer {
        self.nodes.last().map_or_else(BlockPointer::default, |n| n.ptr)
    }

    #[must_use]
    pub fn tail_ref(&self) -> BlockRef {
        self.tail_pointer().as_ref()
    }

    #[must_use]
    pub fn tail_name(&self) -> &str {
        self.nodes.last().map_or("", |n| n.name.as_str())
    }

    /// The path with the last component removed.
    #[must_use]
    pub fn parent_path(&self) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.pop();
        Self {
            folder_branch: self.folder_branch.clone(),
            nodes,
        }
    }

    /// Extend this path by one component.
    #[must_use]
    pub fn child_path(&self, name: &str, ptr: BlockPointer) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.push(PathNode {
            ptr,
            name: name.to_owned(),
        });
        Self {
            folder_branch: self.folder_branch.clone(),
            nodes,
        }
    }

    /// Extend this path with a component whose pointer is not yet known.
    #[must_use]
    pub fn child_path_no_ptr(&self, name: &str) -> Self {
        self.child_path(name, BlockPointer::default())
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            return f.write_str("(empty)");
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(&node.name)?;
        }
        Ok(())
    }
}
