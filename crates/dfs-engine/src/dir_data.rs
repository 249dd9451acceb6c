//! Indirect-block-aware view of one directory.
//!
//! Mirrors the file view: algorithms are parameterized by a block source
//! so they run against the live dirty cache or a scratch cache.  Indirect
//! directory blocks partition children by starting name.

use crate::lock::BlockReqType;
use asupersync::Cx;
use dfs_block::{BlockCrypto, BlockSplitter};
use dfs_error::{EngineError, Result};
use dfs_types::{BlockContext, BlockDirectType, BlockInfo, BlockPointer, BlockUsage, DataVer,
                DirBlock, DirEntry, EntryInfo, FolderPath, IndirectDirPtr, KeyGen, RefNonce,
                UserId};
use std::collections::{BTreeMap, HashSet};
use tracing::{trace, warn};

/// Source of directory blocks for a `DirData` view.
pub(crate) trait DirBlockSource {
    fn get_dir_block(
        &mut self,
        cx: &Cx,
        ptr: BlockPointer,
        kind: BlockReqType,
    ) -> Result<(DirBlock, bool)>;

    fn cache_dirty(&mut self, ptr: BlockPointer, block: &DirBlock) -> Result<()>;
}

struct DirParent {
    ptr: BlockPointer,
    block: DirBlock,
    child_index: usize,
}

/// A directory view bound to a path and a block source.
pub(crate) struct DirData<'a, S: DirBlockSource> {
    dir: FolderPath,
    charged_to: UserId,
    key_gen: KeyGen,
    splitter: &'a dyn BlockSplitter,
    crypto: &'a BlockCrypto,
    source: S,
}

impl<'a, S: DirBlockSource> DirData<'a, S> {
    pub fn new(
        dir: FolderPath,
        charged_to: UserId,
        key_gen: KeyGen,
        splitter: &'a dyn BlockSplitter,
        crypto: &'a BlockCrypto,
        source: S,
    ) -> Self {
        Self {
            dir,
            charged_to,
            key_gen,
            splitter,
            crypto,
            source,
        }
    }

    fn tail_ptr(&self) -> BlockPointer {
        self.dir.tail_pointer()
    }

    fn new_temp_ptr(&self) -> BlockPointer {
        BlockPointer {
            id: self.crypto.temporary_id(),
            key_gen: self.key_gen,
            data_ver: DataVer::FIRST,
            direct_type: BlockDirectType::Direct,
            ref_nonce: RefNonce::ZERO,
            context: BlockContext {
                creator: self.charged_to,
                usage: BlockUsage::Data,
            },
        }
    }

    /// Walk to the leaf whose name range covers `name`.
    fn leaf_for_name(
        &mut self,
        cx: &Cx,
        name: &str,
        kind: BlockReqType,
    ) -> Result<(BlockPointer, DirBlock, Vec<DirParent>)> {
        let tail = self.tail_ptr();
        let (mut block, _) = self.source.get_dir_block(cx, tail, kind)?;
        let mut ptr = tail;
        let mut parents = Vec::new();
        while block.is_indirect {
            if block.iptrs.is_empty() {
                return Err(EngineError::BlockStore(format!(
                    "indirect directory block {ptr} has no children"
                )));
            }
            let idx = block
                .iptrs
                .partition_point(|p| p.off.as_str() <= name)
                .saturating_sub(1);
            let child_ptr = block.iptrs[idx].info.ptr;
            parents.push(DirParent {
                ptr,
                block,
                child_index: idx,
            });
            let (child, _) = self.source.get_dir_block(cx, child_ptr, kind)?;
            ptr = child_ptr;
            block = child;
        }
        Ok((ptr, block, parents))
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub fn lookup(&mut self, cx: &Cx, name: &str) -> Result<DirEntry> {
        let (_, leaf, _) = self.leaf_for_name(cx, name, BlockReqType::Read)?;
        leaf.children
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchName {
                name: name.to_owned(),
            })
    }

    pub fn get_entries(&mut self, cx: &Cx) -> Result<BTreeMap<String, DirEntry>> {
        let tail = self.tail_ptr();
        let (top, _) = self.source.get_dir_block(cx, tail, BlockReqType::Read)?;
        let mut entries = BTreeMap::new();
        self.collect_entries(cx, &top, &mut entries)?;
        Ok(entries)
    }

    fn collect_entries(
        &mut self,
        cx: &Cx,
        block: &DirBlock,
        out: &mut BTreeMap<String, DirEntry>,
    ) -> Result<()> {
        if !block.is_indirect {
            for (name, de) in &block.children {
                out.insert(name.clone(), de.clone());
            }
            return Ok(());
        }
        for iptr in &block.iptrs {
            let (child, _) = self
                .source
                .get_dir_block(cx, iptr.info.ptr, BlockReqType::Read)?;
            self.collect_entries(cx, &child, out)?;
        }
        Ok(())
    }

    pub fn get_children(&mut self, cx: &Cx) -> Result<BTreeMap<String, EntryInfo>> {
        Ok(self
            .get_entries(cx)?
            .into_iter()
            .map(|(name, de)| (name, de.entry_info()))
            .collect())
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    pub fn add_entry(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        if self.lookup(cx, name).is_ok() {
            return Err(EngineError::Exists {
                name: name.to_owned(),
            });
        }
        self.mutate_leaf(cx, name, |children| {
            children.insert(name.to_owned(), de);
            Ok(())
        })
    }

    pub fn update_entry(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        self.mutate_leaf(cx, name, |children| {
            if !children.contains_key(name) {
                return Err(EngineError::NoSuchName {
                    name: name.to_owned(),
                });
            }
            children.insert(name.to_owned(), de);
            Ok(())
        })
    }

    /// Insert or replace, for callers that do not care which.
    pub fn set_entry(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        self.mutate_leaf(cx, name, |children| {
            children.insert(name.to_owned(), de);
            Ok(())
        })
    }

    pub fn remove_entry(&mut self, cx: &Cx, name: &str) -> Result<Vec<BlockInfo>> {
        self.mutate_leaf(cx, name, |children| {
            if children.remove(name).is_none() {
                return Err(EngineError::NoSuchName {
                    name: name.to_owned(),
                });
            }
            Ok(())
        })
    }

    fn mutate_leaf(
        &mut self,
        cx: &Cx,
        name: &str,
        f: impl FnOnce(&mut BTreeMap<String, DirEntry>) -> Result<()>,
    ) -> Result<Vec<BlockInfo>> {
        let (leaf_ptr, mut leaf, mut parents) = self.leaf_for_name(cx, name, BlockReqType::Write)?;
        f(&mut leaf.children)?;

        let mut unrefs = Vec::new();
        if leaf.children.len() > self.splitter.max_dir_entries_per_block() {
            self.split_leaf(cx, leaf_ptr, &mut leaf, &mut parents)?;
        } else {
            self.source.cache_dirty(leaf_ptr, &leaf)?;
        }
        for parent in parents.iter_mut().rev() {
            let iptr = &mut parent.block.iptrs[parent.child_index];
            if iptr.info.encoded_size > 0 {
                unrefs.push(iptr.info);
                iptr.info.encoded_size = 0;
            }
            self.source.cache_dirty(parent.ptr, &parent.block)?;
        }
        Ok(unrefs)
    }

    /// Split an over-full leaf in half by name, growing the top block to
    /// indirect if needed.
    fn split_leaf(
        &mut self,
        cx: &Cx,
        leaf_ptr: BlockPointer,
        leaf: &mut DirBlock,
        parents: &mut Vec<DirParent>,
    ) -> Result<()> {
        let Some(median) = leaf
            .children
            .keys()
            .nth(leaf.children.len() / 2)
            .cloned()
        else {
            self.source.cache_dirty(leaf_ptr, leaf)?;
            return Ok(());
        };
        let second_half = leaf.children.split_off(&median);
        let right_ptr = self.new_temp_ptr();
        let right = DirBlock {
            children: second_half,
            iptrs: Vec::new(),
            is_indirect: false,
        };
        trace!(event = "dir_leaf_split", dir = %self.dir, median = %median);

        if let Some(parent) = parents.last_mut() {
            self.source.cache_dirty(leaf_ptr, leaf)?;
            self.source.cache_dirty(right_ptr, &right)?;
            let idx = parent.child_index + 1;
            parent.block.iptrs.insert(
                idx,
                IndirectDirPtr {
                    info: BlockInfo {
                        ptr: right_ptr,
                        encoded_size: 0,
                    },
                    off: median,
                },
            );
            return Ok(());
        }

        // The leaf is the top block: push both halves down.
        let left_ptr = self.new_temp_ptr();
        let left = DirBlock {
            children: std::mem::take(&mut leaf.children),
            iptrs: Vec::new(),
            is_indirect: false,
        };
        self.source.cache_dirty(left_ptr, &left)?;
        self.source.cache_dirty(right_ptr, &right)?;
        let top = DirBlock {
            children: BTreeMap::new(),
            iptrs: vec![
                IndirectDirPtr {
                    info: BlockInfo {
                        ptr: left_ptr,
                        encoded_size: 0,
                    },
                    off: String::new(),
                },
                IndirectDirPtr {
                    info: BlockInfo {
                        ptr: right_ptr,
                        encoded_size: 0,
                    },
                    off: median,
                },
            ],
            is_indirect: true,
        };
        let _ = cx;
        self.source.cache_dirty(leaf_ptr, &top)?;
        Ok(())
    }

    // ── Enumeration ─────────────────────────────────────────────────────────

    /// Pointers of this directory's child blocks that are currently dirty.
    pub fn dirty_child_ptrs(
        &mut self,
        cx: &Cx,
        is_dirty: &dyn Fn(BlockPointer) -> bool,
    ) -> Result<HashSet<BlockPointer>> {
        let tail = self.tail_ptr();
        let (top, _) = self.source.get_dir_block(cx, tail, BlockReqType::Read)?;
        let mut out = HashSet::new();
        if !top.is_indirect {
            return Ok(out);
        }
        let mut stack: Vec<IndirectDirPtr> = top.iptrs.clone();
        while let Some(iptr) = stack.pop() {
            if is_dirty(iptr.info.ptr) {
                out.insert(iptr.info.ptr);
            }
            if iptr.info.ptr.direct_type == BlockDirectType::Indirect {
                if let Ok((child, _)) =
                    self.source.get_dir_block(cx, iptr.info.ptr, BlockReqType::Read)
                {
                    stack.extend(child.iptrs);
                }
            }
        }
        Ok(out)
    }

    /// Infos for all children of indirect directory blocks.
    pub fn indirect_block_infos(&mut self, cx: &Cx) -> Result<Vec<BlockInfo>> {
        let tail = self.tail_ptr();
        let (top, _) = self.source.get_dir_block(cx, tail, BlockReqType::Read)?;
        let mut infos = Vec::new();
        if !top.is_indirect {
            return Ok(infos);
        }
        let mut stack: Vec<IndirectDirPtr> = top.iptrs.clone();
        while let Some(iptr) = stack.pop() {
            infos.push(iptr.info);
            if iptr.info.ptr.direct_type != BlockDirectType::Indirect {
                continue;
            }
            match self
                .source
                .get_dir_block(cx, iptr.info.ptr, BlockReqType::Read)
            {
                Ok((child, _)) => stack.extend(child.iptrs),
                Err(err) if err.is_recoverable_for_removal() => {
                    warn!(event = "info_enumeration_skipped", ptr = %iptr.info.ptr, error = %err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_block::FixedBlockSplitter;
    use dfs_types::{BlockId, BranchName, EntryType, FolderBranch, PathNode, TlfId};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapSource {
        blocks: HashMap<BlockPointer, DirBlock>,
    }

    impl DirBlockSource for MapSource {
        fn get_dir_block(
            &mut self,
            _cx: &Cx,
            ptr: BlockPointer,
            _kind: BlockReqType,
        ) -> Result<(DirBlock, bool)> {
            let block = self
                .blocks
                .get(&ptr)
                .cloned()
                .ok_or_else(|| EngineError::BlockNotFound {
                    id: ptr.id.to_string(),
                })?;
            Ok((block, true))
        }

        fn cache_dirty(&mut self, ptr: BlockPointer, block: &DirBlock) -> Result<()> {
            self.blocks.insert(ptr, block.clone());
            Ok(())
        }
    }

    fn ptr(b: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId([b; 32]),
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            ..BlockPointer::default()
        }
    }

    fn dir_path() -> FolderPath {
        FolderPath::new(
            FolderBranch {
                tlf: TlfId(1),
                branch: BranchName::master(),
            },
            vec![PathNode {
                ptr: ptr(1),
                name: "tlf".to_owned(),
            }],
        )
    }

    fn entry(b: u8, size: u64) -> DirEntry {
        DirEntry {
            info: BlockInfo {
                ptr: ptr(b),
                encoded_size: 0,
            },
            entry_type: EntryType::File,
            size,
            ..DirEntry::default()
        }
    }

    fn dd_over<'a>(
        source: MapSource,
        splitter: &'a FixedBlockSplitter,
        crypto: &'a BlockCrypto,
    ) -> DirData<'a, MapSource> {
        DirData::new(
            dir_path(),
            UserId(1),
            KeyGen::FIRST,
            splitter,
            crypto,
            source,
        )
    }

    fn seeded() -> MapSource {
        let mut source = MapSource::default();
        source.blocks.insert(ptr(1), DirBlock::new_direct());
        source
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let cx = Cx::for_testing();
        let splitter = FixedBlockSplitter::new(512, 8, 16);
        let crypto = BlockCrypto;
        let mut dd = dd_over(seeded(), &splitter, &crypto);

        dd.add_entry(&cx, "a.txt", entry(9, 5)).unwrap();
        assert_eq!(dd.lookup(&cx, "a.txt").unwrap().size, 5);
        assert!(matches!(
            dd.add_entry(&cx, "a.txt", entry(9, 5)),
            Err(EngineError::Exists { .. })
        ));

        dd.update_entry(&cx, "a.txt", entry(9, 7)).unwrap();
        assert_eq!(dd.lookup(&cx, "a.txt").unwrap().size, 7);

        dd.remove_entry(&cx, "a.txt").unwrap();
        assert!(matches!(
            dd.lookup(&cx, "a.txt"),
            Err(EngineError::NoSuchName { .. })
        ));
        assert!(matches!(
            dd.remove_entry(&cx, "a.txt"),
            Err(EngineError::NoSuchName { .. })
        ));
    }

    #[test]
    fn update_missing_entry_fails() {
        let cx = Cx::for_testing();
        let splitter = FixedBlockSplitter::new(512, 8, 16);
        let crypto = BlockCrypto;
        let mut dd = dd_over(seeded(), &splitter, &crypto);
        assert!(matches!(
            dd.update_entry(&cx, "ghost", entry(9, 1)),
            Err(EngineError::NoSuchName { .. })
        ));
        // set_entry tolerates absence.
        dd.set_entry(&cx, "ghost", entry(9, 1)).unwrap();
        assert_eq!(dd.lookup(&cx, "ghost").unwrap().size, 1);
    }

    #[test]
    fn entries_and_children_agree() {
        let cx = Cx::for_testing();
        let splitter = FixedBlockSplitter::new(512, 8, 16);
        let crypto = BlockCrypto;
        let mut dd = dd_over(seeded(), &splitter, &crypto);
        dd.add_entry(&cx, "b", entry(3, 1)).unwrap();
        dd.add_entry(&cx, "a", entry(4, 2)).unwrap();
        let entries = dd.get_entries(&cx).unwrap();
        assert_eq!(
            entries.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_owned(), "b".to_owned()]
        );
        let children = dd.get_children(&cx).unwrap();
        assert_eq!(children["a"].size, 2);
        assert_eq!(children["b"].size, 1);
    }

    #[test]
    fn overfull_directory_splits_and_still_resolves() {
        let cx = Cx::for_testing();
        let splitter = FixedBlockSplitter::new(512, 8, 4);
        let crypto = BlockCrypto;
        let mut dd = dd_over(seeded(), &splitter, &crypto);

        for (i, name) in ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"]
            .iter()
            .enumerate()
        {
            dd.add_entry(&cx, name, entry(10 + i as u8, i as u64)).unwrap();
        }

        let (top, _) = dd
            .source
            .get_dir_block(&cx, ptr(1), BlockReqType::Read)
            .unwrap();
        assert!(top.is_indirect);

        for (i, name) in ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"]
            .iter()
            .enumerate()
        {
            assert_eq!(dd.lookup(&cx, name).unwrap().size, i as u64);
        }
        assert_eq!(dd.get_entries(&cx).unwrap().len(), 6);
        assert!(!dd.indirect_block_infos(&cx).unwrap().is_empty());
    }
}
