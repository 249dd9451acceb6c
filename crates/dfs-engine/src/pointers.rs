//! Node pointer maintenance: atomic pointer updates after a committed
//! revision, whole-cache fast-forward across a remote revision gap, and
//! pointer-to-node search constrained to an operation's touched set.

use crate::node_cache::{Node, NodeCache, NodeCacheStandard, NodeChange};
use crate::{FolderBlocks, LockState};
use asupersync::Cx;
use dfs_error::{EngineError, Result};
use dfs_types::{BlockPointer, BlockRef, DirEntry, FolderMetadata, FolderOp, FolderPath,
                PathNode, UserId, WriteRange};
use dfs_block::PrefetchPriority;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

impl FolderBlocks {
    /// Rekey one node and hand the prefetcher the new pointer.  Returns
    /// the affected node only when the block ID actually changed.
    pub(crate) fn update_pointer_locked(
        &self,
        old_ptr: BlockPointer,
        new_ptr: BlockPointer,
        should_prefetch: bool,
    ) -> Option<Node> {
        let updated = self.node_cache.update_pointer(old_ptr.as_ref(), new_ptr)?;
        if old_ptr.id == new_ptr.id {
            return None;
        }
        trace!(event = "pointer_updated", old = %old_ptr.id, new = %new_ptr.id);
        if should_prefetch {
            // Only prefetch when the old block was clean-cached; the
            // cache entry tells us the block is worth re-warming.
            if self.config.block_cache.get_with_prefetch(old_ptr).is_ok() {
                self.config
                    .block_ops
                    .prefetcher()
                    .request_prefetch(new_ptr, PrefetchPriority::PointerUpdate);
            }
        }
        self.config
            .block_ops
            .prefetcher()
            .cancel_prefetch(old_ptr.id);
        Some(updated)
    }

    /// Apply every pointer update in the op to the node cache, atomically
    /// under the write lock.  Returns the affected nodes for observer
    /// notification.
    pub fn update_pointers(
        &self,
        ls: &LockState,
        op: &FolderOp,
        should_prefetch: bool,
    ) -> Vec<Node> {
        let _wg = self.lock.write(ls);
        let mut affected = Vec::new();
        for update in op.all_updates() {
            if let Some(node) =
                self.update_pointer_locked(update.old_ptr, update.new_ptr, should_prefetch)
            {
                affected.push(node);
            }
        }
        affected
    }

    fn unlink_during_fast_forward(
        &self,
        cx: &Cx,
        st: &crate::state::LockedState,
        md: &FolderMetadata,
        reference: BlockRef,
    ) {
        let Some(node) = self.node_cache.get(reference) else {
            return;
        };
        let old_path = self.node_cache.path_from_node(node);
        debug!(event = "fast_forward_unlink", path = %old_path, reference = %reference);
        let de = self
            .get_entry_write_locked(cx, st, md, &old_path, true)
            .unwrap_or_else(|err| {
                debug!(event = "fast_forward_entry_missing", error = %err);
                DirEntry::default()
            });
        let _ = self.node_cache.unlink(reference, &old_path, de);
    }

    #[allow(clippy::type_complexity)]
    fn fast_forward_dir_and_children(
        &self,
        cx: &Cx,
        st: &mut crate::state::LockedState,
        md: &FolderMetadata,
        curr_dir: &FolderPath,
        children: &mut HashMap<String, HashSet<PathNode>>,
    ) -> Result<(Vec<NodeChange>, Vec<Node>)> {
        let entries = {
            let mut dd = self.dir_data_write(md, curr_dir, UserId::NIL);
            dd.get_entries(cx)?
        };
        let prefix = curr_dir.to_string();
        let mut changes = Vec::new();
        let mut affected = Vec::new();

        let Some(dir_children) = children.remove(&prefix) else {
            return Ok((changes, affected));
        };
        for child in dir_children {
            let Some(entry) = entries.get(&child.name) else {
                self.unlink_during_fast_forward(cx, st, md, child.ptr.as_ref());
                continue;
            };
            debug!(
                event = "fast_forwarding_node",
                old = %child.ptr,
                new = %entry.info.ptr
            );
            self.update_pointer_locked(child.ptr, entry.info.ptr, true);
            let node = self.node_cache.get(entry.info.ptr.as_ref());
            if entry.entry_type == dfs_types::EntryType::Dir {
                if let Some(node) = node {
                    let new_path = self.node_cache.path_from_node(node);
                    let mut change = NodeChange {
                        node,
                        dir_updated: Vec::new(),
                        file_updated: Vec::new(),
                    };
                    if let Some(subchildren) = children.get(&new_path.to_string()) {
                        change.dir_updated =
                            subchildren.iter().map(|pn| pn.name.clone()).collect();
                    }
                    changes.push(change);
                    affected.push(node);

                    let (child_changes, child_affected) = self
                        .fast_forward_dir_and_children(cx, st, md, &new_path, children)?;
                    changes.extend(child_changes);
                    affected.extend(child_affected);
                }
            } else if let Some(node) = node {
                // A file: invalidate its entire contents.
                changes.push(NodeChange {
                    node,
                    dir_updated: Vec::new(),
                    file_updated: vec![WriteRange { off: 0, len: 0 }],
                });
                affected.push(node);
            }
        }
        Ok((changes, affected))
    }

    /// Reconcile every cached node against a fresh metadata revision,
    /// updating pointers for surviving nodes and unlinking the rest.
    pub fn fast_forward_all_nodes(
        &self,
        cx: &Cx,
        ls: &LockState,
        md: &FolderMetadata,
    ) -> Result<(Vec<NodeChange>, Vec<Node>)> {
        // Hold the write lock through the whole reconciliation.
        let mut wg = self.lock.write(ls);
        let st: &mut crate::state::LockedState = &mut wg;

        let nodes = self.node_cache.all_nodes();
        if nodes.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        debug!(event = "fast_forward_begin", nodes = nodes.len());

        // Build a tree of path-prefix to child path-nodes.
        let mut children: HashMap<String, HashSet<PathNode>> = HashMap::new();
        let mut root_path: Option<FolderPath> = None;
        for node in &nodes {
            let path = self.node_cache.path_from_node(*node);
            if !path.is_valid() {
                continue;
            }
            if path.nodes.len() == 1 {
                root_path = Some(path.clone());
            }
            let mut prev_prefix = String::new();
            for (i, pn) in path.nodes.iter().enumerate() {
                if i > 0 {
                    children
                        .entry(prev_prefix.clone())
                        .or_default()
                        .insert(pn.clone());
                }
                if prev_prefix.is_empty() {
                    prev_prefix = pn.name.clone();
                } else {
                    prev_prefix = format!("{prev_prefix}/{}", pn.name);
                }
            }
        }
        let Some(mut root_path) = root_path else {
            return Err(EngineError::InvalidPath {
                path: "no cached root".to_owned(),
            });
        };

        let new_root_ptr = md.root_entry.info.ptr;
        debug!(
            event = "fast_forward_root",
            old = %root_path.tail_pointer(),
            new = %new_root_ptr
        );
        self.update_pointer_locked(root_path.tail_pointer(), new_root_ptr, false);
        root_path.nodes[0].ptr = new_root_ptr;

        let mut changes = Vec::new();
        let mut affected = Vec::new();
        if let Some(root_node) = self.node_cache.get(new_root_ptr.as_ref()) {
            let mut change = NodeChange {
                node: root_node,
                dir_updated: Vec::new(),
                file_updated: Vec::new(),
            };
            if let Some(root_children) = children.get(&root_path.to_string()) {
                change.dir_updated = root_children.iter().map(|pn| pn.name.clone()).collect();
            }
            changes.push(change);
            affected.push(root_node);
        }

        let (child_changes, child_affected) =
            self.fast_forward_dir_and_children(cx, st, md, &root_path, &mut children)?;
        changes.extend(child_changes);
        affected.extend(child_affected);

        // Any prefix that survived the descent has unreachable children.
        let leftovers: Vec<PathNode> = children
            .drain()
            .flat_map(|(_, pns)| pns.into_iter())
            .collect();
        for child in leftovers {
            self.unlink_during_fast_forward(cx, st, md, child.ptr.as_ref());
        }
        debug!(event = "fast_forward_complete", changes = changes.len());
        Ok((changes, affected))
    }

    // ── Search ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn search_for_nodes_in_dir(
        &self,
        cx: &Cx,
        rg: &mut crate::lock::ReadLockCtx<'_>,
        cache: &Arc<dyn NodeCache>,
        new_ptrs: &HashSet<BlockPointer>,
        md: &FolderMetadata,
        root_node: Node,
        curr_dir: &FolderPath,
        node_map: &mut HashMap<BlockPointer, Option<Node>>,
        num_found_so_far: usize,
    ) -> Result<usize> {
        let entries = {
            let mut dd = self.dir_data_read(rg, md, curr_dir);
            dd.get_entries(cx)?
        };

        // The fetch may have released the lock; if the cache raced ahead
        // of us, the caller must retry against a throwaway cache.
        if curr_dir.nodes[0].ptr != cache.path_from_node(root_node).tail_pointer() {
            return Err(EngineError::OutOfDateCache);
        }

        if num_found_so_far >= node_map.len() {
            return Ok(0);
        }

        let mut num_found = 0;
        for (name, de) in &entries {
            if node_map.contains_key(&de.info.ptr) {
                let child_path = curr_dir.child_path(name, de.info.ptr);
                let mut node = root_node;
                for pn in &child_path.nodes[1..] {
                    node = cache.get_or_create(pn.ptr, &pn.name, Some(node))?;
                }
                node_map.insert(de.info.ptr, Some(node));
                num_found += 1;
                if num_found_so_far + num_found >= node_map.len() {
                    return Ok(num_found);
                }
            }

            if de.entry_type == dfs_types::EntryType::Dir && new_ptrs.contains(&de.info.ptr) {
                let child_path = curr_dir.child_path(name, de.info.ptr);
                let found = self.search_for_nodes_in_dir(
                    cx,
                    rg,
                    cache,
                    new_ptrs,
                    md,
                    root_node,
                    &child_path,
                    node_map,
                    num_found_so_far + num_found,
                )?;
                num_found += found;
                if num_found_so_far + num_found >= node_map.len() {
                    return Ok(num_found);
                }
            }
        }
        Ok(num_found)
    }

    #[allow(clippy::type_complexity)]
    fn try_search_with_cache(
        &self,
        cx: &Cx,
        rg: &mut crate::lock::ReadLockCtx<'_>,
        cache: &Arc<dyn NodeCache>,
        ptrs: &[BlockPointer],
        new_ptrs: &HashSet<BlockPointer>,
        md: &FolderMetadata,
        root_ptr: BlockPointer,
    ) -> Result<HashMap<BlockPointer, Option<Node>>> {
        let mut node_map: HashMap<BlockPointer, Option<Node>> =
            ptrs.iter().map(|p| (*p, None)).collect();
        if ptrs.is_empty() {
            return Ok(node_map);
        }

        let node = if Arc::ptr_eq(cache, &self.node_cache) {
            // The live cache must already know the root when it is up to
            // date with this revision.
            cache
                .get(root_ptr.as_ref())
                .ok_or(EngineError::OutOfDateCache)?
        } else {
            cache.get_or_create(root_ptr, &md.tlf.to_string(), None)?
        };

        let mut num_found = 0;
        if let Some(slot) = node_map.get_mut(&root_ptr) {
            *slot = Some(node);
            num_found += 1;
            if num_found >= node_map.len() {
                return Ok(node_map);
            }
        }

        let root_path = cache.path_from_node(node);
        if root_path.nodes.len() != 1 {
            return Err(EngineError::InvalidPath {
                path: root_path.to_string(),
            });
        }

        self.search_for_nodes_in_dir(
            cx, rg, cache, new_ptrs, md, node, &root_path, &mut node_map, num_found,
        )?;

        if root_ptr != cache.path_from_node(node).tail_pointer() {
            return Err(EngineError::OutOfDateCache);
        }
        Ok(node_map)
    }

    /// Resolve each pointer in `ptrs` to a node, recursing only into
    /// directories whose pointers appear in `new_ptrs`.  If the live
    /// cache turns out to be stale, the search retries on a throwaway
    /// cache so stale nodes never pollute the live one.  Returns the map
    /// (unfound pointers hold `None`) and the cache that produced it.
    #[allow(clippy::type_complexity)]
    pub fn search_for_nodes(
        &self,
        cx: &Cx,
        cache: Arc<dyn NodeCache>,
        ptrs: &[BlockPointer],
        new_ptrs: &HashSet<BlockPointer>,
        md: &FolderMetadata,
        root_ptr: BlockPointer,
    ) -> Result<(HashMap<BlockPointer, Option<Node>>, Arc<dyn NodeCache>)> {
        let ls = LockState::new();
        let mut rg = self.lock.read(&ls);
        match self.try_search_with_cache(cx, &mut rg, &cache, ptrs, new_ptrs, md, root_ptr) {
            Ok(node_map) => Ok((node_map, cache)),
            Err(EngineError::OutOfDateCache) => {
                debug!(event = "search_retry_throwaway_cache", root = %root_ptr);
                let scratch: Arc<dyn NodeCache> =
                    Arc::new(NodeCacheStandard::new(self.folder_branch().clone()));
                let node_map = self
                    .try_search_with_cache(cx, &mut rg, &scratch, ptrs, new_ptrs, md, root_ptr)?;
                Ok((node_map, scratch))
            }
            Err(err) => Err(err),
        }
    }

    /// Like `search_for_nodes`, but returns a consistent view of each
    /// found pointer's path, verifying the tail matches.
    pub fn search_for_paths(
        &self,
        cx: &Cx,
        cache: Arc<dyn NodeCache>,
        ptrs: &[BlockPointer],
        new_ptrs: &HashSet<BlockPointer>,
        md: &FolderMetadata,
        root_ptr: BlockPointer,
    ) -> Result<HashMap<BlockPointer, FolderPath>> {
        let (node_map, cache) =
            self.search_for_nodes(cx, cache, ptrs, new_ptrs, md, root_ptr)?;
        let mut paths = HashMap::new();
        for (ptr, node) in node_map {
            let Some(node) = node else {
                paths.insert(ptr, FolderPath::default());
                continue;
            };
            let path = cache.path_from_node(node);
            if path.tail_pointer() != ptr {
                return Err(EngineError::NodeNotFound {
                    ptr: ptr.to_string(),
                });
            }
            paths.insert(ptr, path);
        }
        Ok(paths)
    }
}
