//! Path/node translation cache.
//!
//! Callers hold opaque `Node` handles; the cache maps block references to
//! nodes and reconstructs the current path of any node on demand.  Pointer
//! updates rekey a node without disturbing its identity, and unlinked
//! nodes keep a detached copy of their last known directory entry.

use dfs_error::{EngineError, Result};
use dfs_types::{BlockPointer, BlockRef, DirEntry, FolderBranch, FolderPath, PathNode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Opaque handle to a cached node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    id: u64,
}

impl Node {
    #[must_use]
    pub fn id(self) -> u64 {
        self.id
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.id)
    }
}

/// A change to report to observers after a remote update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChange {
    pub node: Node,
    /// Child names whose entries changed, for directories.
    pub dir_updated: Vec<String>,
    /// Invalidated ranges, for files; `{0, 0}` invalidates everything.
    pub file_updated: Vec<dfs_types::WriteRange>,
}

/// Opaque undo token for a node cache mutation.
#[derive(Debug)]
pub struct NodeCacheUndo(UndoKind);

#[derive(Debug)]
enum UndoKind {
    Noop,
    Restore {
        id: u64,
        parent: Option<u64>,
        name: String,
        unlinked: bool,
        unlinked_de: DirEntry,
    },
}

/// Path/handle translation consumed by the engine.
pub trait NodeCache: Send + Sync {
    fn get(&self, reference: BlockRef) -> Option<Node>;

    /// Find or create the node for `ptr`.  A `None` parent creates the
    /// folder root.
    fn get_or_create(&self, ptr: BlockPointer, name: &str, parent: Option<Node>) -> Result<Node>;

    /// The node's current path; invalid (empty) if the node is unlinked or
    /// unknown.
    fn path_from_node(&self, node: Node) -> FolderPath;

    /// Rekey the node holding `old_ref` to `new_ptr`.  Returns the node if
    /// one was updated.
    fn update_pointer(&self, old_ref: BlockRef, new_ptr: BlockPointer) -> Option<Node>;

    /// Reparent and rename a node.
    fn move_node(&self, reference: BlockRef, new_parent: Option<Node>, new_name: &str)
        -> Result<NodeCacheUndo>;

    /// Detach a node, remembering its last known entry.
    fn unlink(&self, reference: BlockRef, old_path: &FolderPath, old_de: DirEntry)
        -> NodeCacheUndo;

    fn is_unlinked(&self, node: Node) -> bool;

    fn unlinked_dir_entry(&self, node: Node) -> DirEntry;

    fn update_unlinked_dir_entry(&self, node: Node, de: DirEntry);

    fn all_nodes(&self) -> Vec<Node>;

    /// Revert a prior move or unlink.
    fn apply_undo(&self, undo: NodeCacheUndo);
}

#[derive(Debug, Clone)]
struct NcEntry {
    ptr: BlockPointer,
    name: String,
    parent: Option<u64>,
    unlinked: bool,
    unlinked_de: DirEntry,
}

#[derive(Debug, Default)]
struct NcState {
    next_id: u64,
    by_id: HashMap<u64, NcEntry>,
    ref_to_id: HashMap<BlockRef, u64>,
}

/// The standard in-memory node cache.
#[derive(Debug)]
pub struct NodeCacheStandard {
    folder_branch: FolderBranch,
    state: Mutex<NcState>,
}

impl NodeCacheStandard {
    #[must_use]
    pub fn new(folder_branch: FolderBranch) -> Self {
        Self {
            folder_branch,
            state: Mutex::new(NcState::default()),
        }
    }
}

impl NodeCache for NodeCacheStandard {
    fn get(&self, reference: BlockRef) -> Option<Node> {
        let state = self.state.lock();
        state.ref_to_id.get(&reference).map(|id| Node { id: *id })
    }

    fn get_or_create(&self, ptr: BlockPointer, name: &str, parent: Option<Node>) -> Result<Node> {
        if !ptr.is_valid() {
            return Err(EngineError::InvalidBlockRef {
                ptr: ptr.to_string(),
            });
        }
        let mut state = self.state.lock();
        if let Some(id) = state.ref_to_id.get(&ptr.as_ref()) {
            return Ok(Node { id: *id });
        }
        let parent_id = match parent {
            Some(p) => {
                if !state.by_id.contains_key(&p.id) {
                    return Err(EngineError::NodeNotFound { ptr: p.to_string() });
                }
                Some(p.id)
            }
            None => None,
        };
        let id = state.next_id;
        state.next_id += 1;
        state.by_id.insert(
            id,
            NcEntry {
                ptr,
                name: name.to_owned(),
                parent: parent_id,
                unlinked: false,
                unlinked_de: DirEntry::default(),
            },
        );
        state.ref_to_id.insert(ptr.as_ref(), id);
        Ok(Node { id })
    }

    fn path_from_node(&self, node: Node) -> FolderPath {
        let state = self.state.lock();
        let mut nodes = Vec::new();
        let mut cursor = Some(node.id);
        while let Some(id) = cursor {
            let Some(entry) = state.by_id.get(&id) else {
                return FolderPath::new(self.folder_branch.clone(), Vec::new());
            };
            if entry.unlinked {
                return FolderPath::new(self.folder_branch.clone(), Vec::new());
            }
            nodes.push(PathNode {
                ptr: entry.ptr,
                name: entry.name.clone(),
            });
            cursor = entry.parent;
        }
        nodes.reverse();
        FolderPath::new(self.folder_branch.clone(), nodes)
    }

    fn update_pointer(&self, old_ref: BlockRef, new_ptr: BlockPointer) -> Option<Node> {
        let mut state = self.state.lock();
        let id = state.ref_to_id.remove(&old_ref)?;
        if let Some(entry) = state.by_id.get_mut(&id) {
            entry.ptr = new_ptr;
        }
        state.ref_to_id.insert(new_ptr.as_ref(), id);
        Some(Node { id })
    }

    fn move_node(
        &self,
        reference: BlockRef,
        new_parent: Option<Node>,
        new_name: &str,
    ) -> Result<NodeCacheUndo> {
        let mut state = self.state.lock();
        let Some(&id) = state.ref_to_id.get(&reference) else {
            return Ok(NodeCacheUndo(UndoKind::Noop));
        };
        let parent_id = match new_parent {
            Some(p) => {
                if !state.by_id.contains_key(&p.id) {
                    return Err(EngineError::NodeNotFound { ptr: p.to_string() });
                }
                Some(p.id)
            }
            None => None,
        };
        let Some(entry) = state.by_id.get_mut(&id) else {
            return Ok(NodeCacheUndo(UndoKind::Noop));
        };
        let undo = NodeCacheUndo(UndoKind::Restore {
            id,
            parent: entry.parent,
            name: entry.name.clone(),
            unlinked: entry.unlinked,
            unlinked_de: entry.unlinked_de.clone(),
        });
        entry.parent = parent_id;
        entry.name = new_name.to_owned();
        Ok(undo)
    }

    fn unlink(
        &self,
        reference: BlockRef,
        _old_path: &FolderPath,
        old_de: DirEntry,
    ) -> NodeCacheUndo {
        let mut state = self.state.lock();
        let Some(&id) = state.ref_to_id.get(&reference) else {
            return NodeCacheUndo(UndoKind::Noop);
        };
        let Some(entry) = state.by_id.get_mut(&id) else {
            return NodeCacheUndo(UndoKind::Noop);
        };
        let undo = NodeCacheUndo(UndoKind::Restore {
            id,
            parent: entry.parent,
            name: entry.name.clone(),
            unlinked: entry.unlinked,
            unlinked_de: entry.unlinked_de.clone(),
        });
        entry.unlinked = true;
        entry.unlinked_de = old_de;
        undo
    }

    fn is_unlinked(&self, node: Node) -> bool {
        let state = self.state.lock();
        state.by_id.get(&node.id).is_some_and(|e| e.unlinked)
    }

    fn unlinked_dir_entry(&self, node: Node) -> DirEntry {
        let state = self.state.lock();
        state
            .by_id
            .get(&node.id)
            .map(|e| e.unlinked_de.clone())
            .unwrap_or_default()
    }

    fn update_unlinked_dir_entry(&self, node: Node, de: DirEntry) {
        let mut state = self.state.lock();
        if let Some(entry) = state.by_id.get_mut(&node.id) {
            entry.unlinked_de = de;
        }
    }

    fn all_nodes(&self) -> Vec<Node> {
        let state = self.state.lock();
        let mut nodes: Vec<Node> = state.by_id.keys().map(|id| Node { id: *id }).collect();
        nodes.sort();
        nodes
    }

    fn apply_undo(&self, undo: NodeCacheUndo) {
        let UndoKind::Restore {
            id,
            parent,
            name,
            unlinked,
            unlinked_de,
        } = undo.0
        else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(entry) = state.by_id.get_mut(&id) {
            entry.parent = parent;
            entry.name = name;
            entry.unlinked = unlinked;
            entry.unlinked_de = unlinked_de;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::{BlockId, BranchName, DataVer, KeyGen, TlfId};

    fn ptr(b: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId([b; 32]),
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            ..BlockPointer::default()
        }
    }

    fn cache() -> NodeCacheStandard {
        NodeCacheStandard::new(FolderBranch {
            tlf: TlfId(7),
            branch: BranchName::master(),
        })
    }

    #[test]
    fn create_and_walk_paths() {
        let nc = cache();
        let root = nc.get_or_create(ptr(1), "tlf", None).unwrap();
        let dir = nc.get_or_create(ptr(2), "dir", Some(root)).unwrap();
        let file = nc.get_or_create(ptr(3), "f", Some(dir)).unwrap();

        let p = nc.path_from_node(file);
        assert!(p.is_valid());
        assert_eq!(p.to_string(), "tlf/dir/f");
        assert_eq!(p.tail_pointer(), ptr(3));

        // Identical ref returns the same node.
        let again = nc.get_or_create(ptr(3), "f", Some(dir)).unwrap();
        assert_eq!(again, file);
    }

    #[test]
    fn update_pointer_rekeys_node() {
        let nc = cache();
        let root = nc.get_or_create(ptr(1), "tlf", None).unwrap();
        let file = nc.get_or_create(ptr(3), "f", Some(root)).unwrap();

        let updated = nc.update_pointer(ptr(3).as_ref(), ptr(9)).unwrap();
        assert_eq!(updated, file);
        assert!(nc.get(ptr(3).as_ref()).is_none());
        assert_eq!(nc.get(ptr(9).as_ref()), Some(file));
        assert_eq!(nc.path_from_node(file).tail_pointer(), ptr(9));
    }

    #[test]
    fn unlink_and_undo() {
        let nc = cache();
        let root = nc.get_or_create(ptr(1), "tlf", None).unwrap();
        let file = nc.get_or_create(ptr(3), "f", Some(root)).unwrap();
        let de = DirEntry {
            size: 11,
            ..DirEntry::default()
        };
        let path = nc.path_from_node(file);
        let undo = nc.unlink(ptr(3).as_ref(), &path, de.clone());

        assert!(nc.is_unlinked(file));
        assert_eq!(nc.unlinked_dir_entry(file).size, 11);
        assert!(!nc.path_from_node(file).is_valid());
        // The handle remains resolvable while unlinked.
        assert_eq!(nc.get(ptr(3).as_ref()), Some(file));

        nc.apply_undo(undo);
        assert!(!nc.is_unlinked(file));
        assert!(nc.path_from_node(file).is_valid());
    }

    #[test]
    fn move_and_undo() {
        let nc = cache();
        let root = nc.get_or_create(ptr(1), "tlf", None).unwrap();
        let a = nc.get_or_create(ptr(2), "a", Some(root)).unwrap();
        let b = nc.get_or_create(ptr(3), "b", Some(root)).unwrap();
        let file = nc.get_or_create(ptr(4), "f", Some(a)).unwrap();

        let undo = nc.move_node(ptr(4).as_ref(), Some(b), "g").unwrap();
        assert_eq!(nc.path_from_node(file).to_string(), "tlf/b/g");
        nc.apply_undo(undo);
        assert_eq!(nc.path_from_node(file).to_string(), "tlf/a/f");
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let nc = cache();
        let ghost = Node { id: 404 };
        assert!(nc.get_or_create(ptr(5), "x", Some(ghost)).is_err());
    }
}
