//! Directory cache mutations with undo, rename semantics, fast-forward
//! across a remote revision, and pointer search.

mod common;

use common::{Harness, TLF};
use dfs_block::BlockCache;
use dfs_block::CacheLifetime;
use dfs_engine::{LockState, NodeCache, ready_block};
use dfs_error::EngineError;
use dfs_types::{Block, BlockPointer, DirBlock, DirEntry, EntryType, FileBlock};
use std::collections::HashSet;
use std::sync::Arc;

fn new_entry(h: &Harness, contents: &[u8]) -> DirEntry {
    let block = Block::File(FileBlock::new_direct(contents.to_vec()));
    let (info, _, ready) = ready_block(
        &h.cx,
        TLF,
        &h.md,
        h.bcache.as_ref(),
        h.bops.as_ref(),
        &h.crypto,
        &block,
        h.user,
    )
    .expect("ready new file");
    h.server.put(info.ptr.id, info.ptr.ref_nonce, ready.buf);
    h.bcache
        .put(TLF, info.ptr, block, info.encoded_size, CacheLifetime::Transient)
        .expect("cache new file");
    DirEntry {
        info,
        entry_type: EntryType::File,
        size: contents.len() as u64,
        mtime: 0,
        ctime: 0,
        sym_path: None,
    }
}

#[test]
fn add_entry_and_undo_round_trip() {
    let h = Harness::new(512, &[("existing", b"1")]);
    let ls = LockState::new();
    let de = new_entry(&h, b"fresh");

    let before_entries = h
        .eng
        .get_entries(&h.cx, &ls, &h.md, &h.root_path)
        .expect("entries before");
    let before_dirty_dirs = h.eng.get_dirty_dir_block_refs(&ls);

    let undo = h
        .eng
        .add_dir_entry_in_cache(&h.cx, &ls, &h.md, &h.root_path, "new.txt", de)
        .expect("add entry");

    let entries = h
        .eng
        .get_entries(&h.cx, &ls, &h.md, &h.root_path)
        .expect("entries after add");
    assert!(entries.contains_key("new.txt"));
    assert_eq!(h.eng.get_dirty_dir_block_refs(&ls).len(), 1);

    h.eng.undo_dir_cache(&h.cx, &ls, undo);

    let after = h
        .eng
        .get_entries(&h.cx, &ls, &h.md, &h.root_path)
        .expect("entries after undo");
    assert_eq!(after, before_entries);
    assert_eq!(h.eng.get_dirty_dir_block_refs(&ls), before_dirty_dirs);
}

#[test]
fn remove_entry_unlinks_node_and_undo_restores() {
    let h = Harness::new(512, &[("doomed", b"123")]);
    let (node, path) = h.file("doomed");
    let ls = LockState::new();
    let de = h.entry(&path);

    let undo = h
        .eng
        .remove_dir_entry_in_cache(&h.cx, &ls, &h.md, &h.root_path, "doomed", de.clone())
        .expect("remove entry");

    assert!(matches!(
        h.eng.get_entry(&h.cx, &ls, &h.md, &path),
        Err(EngineError::NoSuchName { .. })
    ));
    assert!(h.nc.is_unlinked(node));
    // The unlinked entry store still answers for the open handle.
    let deleted = h
        .eng
        .get_entry_even_if_deleted(&h.cx, &ls, &h.md, &path)
        .expect("deleted entry");
    assert_eq!(deleted.size, 3);

    h.eng.undo_dir_cache(&h.cx, &ls, undo);
    assert!(!h.nc.is_unlinked(node));
    assert_eq!(h.entry(&path).size, 3);
}

#[test]
fn rename_with_replacement() {
    // Two directories under the root would need directory creation
    // plumbing; the same semantics are observable with both parents
    // being the root and distinct names.
    let h = Harness::new(512, &[("file-a", b"abc"), ("file-b", b"1234567")]);
    let (node_a, path_a) = h.file("file-a");
    let (node_b, _path_b) = h.file("file-b");
    let ls = LockState::new();

    let (new_de, replaced_de, ro) = h
        .eng
        .prep_rename(&h.cx, &ls, &h.md, &h.root_path, "file-a", &h.root_path, "file-b")
        .expect("prep rename");
    assert_eq!(new_de.size, 3);
    assert_eq!(replaced_de.size, 7);
    assert_eq!(ro.old_name, "file-a");
    assert!(ro.new_dir.is_none());

    let undo = h
        .eng
        .rename_dir_entry_in_cache(
            &h.cx,
            &ls,
            &h.md,
            &h.root_path,
            "file-a",
            &h.root_path,
            "file-b",
            new_de,
            replaced_de,
        )
        .expect("rename")
        .expect("undo present");

    // The destination now holds the source's entry.
    let dest = h
        .eng
        .get_entry(&h.cx, &ls, &h.md, &h.root_path.child_path_no_ptr("file-b"))
        .expect("dest entry");
    assert_eq!(dest.size, 3);
    assert!(matches!(
        h.eng
            .get_entry(&h.cx, &ls, &h.md, &h.root_path.child_path_no_ptr("file-a")),
        Err(EngineError::NoSuchName { .. })
    ));
    // The replaced file's node is unlinked; the renamed one is not.
    assert!(h.nc.is_unlinked(node_b));
    assert!(!h.nc.is_unlinked(node_a));
    assert_eq!(h.nc.path_from_node(node_a).tail_name(), "file-b");

    // Undo restores both entries and the node state atomically.
    h.eng.undo_dir_cache(&h.cx, &ls, undo);
    assert_eq!(h.entry(&path_a).size, 3);
    let restored_b = h
        .eng
        .get_entry(&h.cx, &ls, &h.md, &h.root_path.child_path_no_ptr("file-b"))
        .expect("restored b");
    assert_eq!(restored_b.size, 7);
    assert!(!h.nc.is_unlinked(node_b));
    assert_eq!(h.nc.path_from_node(node_a).tail_name(), "file-a");
}

#[test]
fn rename_with_replacement_across_directories() {
    let mut h = Harness::new(512, &[]);
    let ls = LockState::new();

    // Build /src/file-a (size 3) and /dst/file-a (size 7) by hand.
    let de_a = new_entry(&h, b"abc");
    let de_b = new_entry(&h, b"1234567");
    let mut src_block = DirBlock::new_direct();
    src_block.children.insert("file-a".to_owned(), de_a);
    let mut dst_block = DirBlock::new_direct();
    dst_block.children.insert("file-a".to_owned(), de_b);

    let dir_entry = |block: DirBlock| {
        let wrapped = Block::Dir(block);
        let (info, _, ready) = ready_block(
            &h.cx,
            TLF,
            &h.md,
            h.bcache.as_ref(),
            h.bops.as_ref(),
            &h.crypto,
            &wrapped,
            h.user,
        )
        .expect("ready dir");
        h.server.put(info.ptr.id, info.ptr.ref_nonce, ready.buf);
        h.bcache
            .put(TLF, info.ptr, wrapped, info.encoded_size, CacheLifetime::Transient)
            .expect("cache dir");
        DirEntry {
            info,
            entry_type: EntryType::Dir,
            size: 1,
            mtime: 0,
            ctime: 0,
            sym_path: None,
        }
    };
    let src_de = dir_entry(src_block);
    let dst_de = dir_entry(dst_block);

    let mut root_block = DirBlock::new_direct();
    root_block.children.insert("src".to_owned(), src_de);
    root_block.children.insert("dst".to_owned(), dst_de);
    let root_wrapped = Block::Dir(root_block);
    let (root_info, _, root_ready) = ready_block(
        &h.cx,
        TLF,
        &h.md,
        h.bcache.as_ref(),
        h.bops.as_ref(),
        &h.crypto,
        &root_wrapped,
        h.user,
    )
    .expect("ready root");
    h.server
        .put(root_info.ptr.id, root_info.ptr.ref_nonce, root_ready.buf);
    h.bcache
        .put(TLF, root_info.ptr, root_wrapped, root_info.encoded_size, CacheLifetime::Transient)
        .expect("cache root");
    h.md.root_entry.info = root_info;
    h.root_path.nodes[0].ptr = root_info.ptr;
    let root_node = h.nc.get_or_create(root_info.ptr, "tlf", None).expect("root");

    let (src_node, _) = h
        .eng
        .lookup(&h.cx, &ls, &h.md, root_node, "src")
        .expect("lookup src");
    let src_node = src_node.expect("src node");
    let (dst_node, _) = h
        .eng
        .lookup(&h.cx, &ls, &h.md, root_node, "dst")
        .expect("lookup dst");
    let dst_node = dst_node.expect("dst node");
    let src_path = h.nc.path_from_node(src_node);
    let dst_path = h.nc.path_from_node(dst_node);

    let (a_node, _) = h
        .eng
        .lookup(&h.cx, &ls, &h.md, src_node, "file-a")
        .expect("lookup /src/file-a");
    let a_node = a_node.expect("file node");
    let (b_node, _) = h
        .eng
        .lookup(&h.cx, &ls, &h.md, dst_node, "file-a")
        .expect("lookup /dst/file-a");
    let b_node = b_node.expect("replaced node");

    let (new_de, replaced_de, ro) = h
        .eng
        .prep_rename(&h.cx, &ls, &h.md, &src_path, "file-a", &dst_path, "file-a")
        .expect("prep rename");
    assert_eq!(new_de.size, 3);
    assert_eq!(replaced_de.size, 7);
    assert!(ro.new_dir.is_some());

    let undo = h
        .eng
        .rename_dir_entry_in_cache(
            &h.cx,
            &ls,
            &h.md,
            &src_path,
            "file-a",
            &dst_path,
            "file-a",
            new_de,
            replaced_de,
        )
        .expect("rename")
        .expect("undo present");

    // Destination carries the source's entry, source no longer lists it.
    let dest = h
        .eng
        .get_entry(&h.cx, &ls, &h.md, &dst_path.child_path_no_ptr("file-a"))
        .expect("dest entry");
    assert_eq!(dest.size, 3);
    assert!(matches!(
        h.eng
            .get_entry(&h.cx, &ls, &h.md, &src_path.child_path_no_ptr("file-a")),
        Err(EngineError::NoSuchName { .. })
    ));
    // The replaced entry's node was unlinked; the moved node now lives
    // under the destination parent.
    assert!(h.nc.is_unlinked(b_node));
    assert_eq!(h.nc.path_from_node(a_node).to_string(), "tlf/dst/file-a");

    // A single undo restores both directories and the node state.
    h.eng.undo_dir_cache(&h.cx, &ls, undo);
    assert_eq!(
        h.eng
            .get_entry(&h.cx, &ls, &h.md, &src_path.child_path_no_ptr("file-a"))
            .expect("restored src entry")
            .size,
        3
    );
    assert_eq!(
        h.eng
            .get_entry(&h.cx, &ls, &h.md, &dst_path.child_path_no_ptr("file-a"))
            .expect("restored dst entry")
            .size,
        7
    );
    assert!(!h.nc.is_unlinked(b_node));
    assert_eq!(h.nc.path_from_node(a_node).to_string(), "tlf/src/file-a");
}

#[test]
fn rename_onto_itself_is_noop() {
    let h = Harness::new(512, &[("same", b"x")]);
    let ls = LockState::new();
    let (new_de, replaced_de, _ro) = h
        .eng
        .prep_rename(&h.cx, &ls, &h.md, &h.root_path, "same", &h.root_path, "same")
        .expect("prep");
    let undo = h
        .eng
        .rename_dir_entry_in_cache(
            &h.cx,
            &ls,
            &h.md,
            &h.root_path,
            "same",
            &h.root_path,
            "same",
            new_de,
            replaced_de,
        )
        .expect("noop rename");
    assert!(undo.is_none());
    let state = h.eng.get_state(&ls);
    assert_eq!(state, dfs_engine::OverallBlockState::Clean);
}

#[test]
fn setattr_updates_cached_entry() {
    let h = Harness::new(512, &[("f", b"abc")]);
    let (_, path) = h.file("f");
    let ls = LockState::new();

    let mut real = h.entry(&path);
    real.mtime = 777;
    real.ctime = 888;
    let undo = h
        .eng
        .set_attr_in_dir_entry_in_cache(
            &h.cx,
            &ls,
            &h.md,
            &path,
            real,
            dfs_types::AttrChange::Mtime,
        )
        .expect("setattr");
    let de = h.entry(&path);
    assert_eq!(de.mtime, 777);
    assert_eq!(de.ctime, 888);

    h.eng.undo_dir_cache(&h.cx, &ls, undo);
    let de = h.entry(&path);
    assert_eq!(de.mtime, 0);
}

#[test]
fn get_state_tracks_dirty_dirs() {
    let h = Harness::new(512, &[("f", b"")]);
    let ls = LockState::new();
    assert_eq!(h.eng.get_state(&ls), dfs_engine::OverallBlockState::Clean);
    let de = new_entry(&h, b"zz");
    let _undo = h
        .eng
        .add_dir_entry_in_cache(&h.cx, &ls, &h.md, &h.root_path, "dirty", de)
        .expect("add");
    assert_eq!(h.eng.get_state(&ls), dfs_engine::OverallBlockState::Dirty);

    h.eng.clear_all_dirty_dirs(&h.cx, &ls, &h.md);
    assert_eq!(h.eng.get_state(&ls), dfs_engine::OverallBlockState::Clean);
}

#[test]
fn fast_forward_over_remote_update() {
    let mut h = Harness::new(512, &[("keep", b"kk"), ("gone", b"gg")]);
    let (keep_node, _keep_path) = h.file("keep");
    let (gone_node, _gone_path) = h.file("gone");
    let ls = LockState::new();

    // Build the remote revision: "keep" rewritten under a new pointer,
    // "gone" deleted, root republished.
    let mut md2 = h.md.clone();
    md2.revision += 1;
    let keep_block = Block::File(FileBlock::new_direct(b"kk-v2".to_vec()));
    let (keep_info, _, keep_ready) = ready_block(
        &h.cx,
        TLF,
        &md2,
        h.bcache.as_ref(),
        h.bops.as_ref(),
        &h.crypto,
        &keep_block,
        h.user,
    )
    .expect("ready keep v2");
    h.server
        .put(keep_info.ptr.id, keep_info.ptr.ref_nonce, keep_ready.buf);

    let mut new_root = DirBlock::new_direct();
    new_root.children.insert(
        "keep".to_owned(),
        DirEntry {
            info: keep_info,
            entry_type: EntryType::File,
            size: 5,
            mtime: 9,
            ctime: 9,
            sym_path: None,
        },
    );
    let new_root_block = Block::Dir(new_root);
    let (new_root_info, _, root_ready) = ready_block(
        &h.cx,
        TLF,
        &md2,
        h.bcache.as_ref(),
        h.bops.as_ref(),
        &h.crypto,
        &new_root_block,
        h.user,
    )
    .expect("ready new root");
    h.server
        .put(new_root_info.ptr.id, new_root_info.ptr.ref_nonce, root_ready.buf);
    h.bcache
        .put(
            TLF,
            new_root_info.ptr,
            new_root_block,
            new_root_info.encoded_size,
            CacheLifetime::Transient,
        )
        .expect("cache new root");
    md2.root_entry.info = new_root_info;

    let (changes, affected) = h
        .eng
        .fast_forward_all_nodes(&h.cx, &ls, &md2)
        .expect("fast forward");
    h.md = md2;
    h.root_path.nodes[0].ptr = h.md.root_entry.info.ptr;

    // The surviving file was rekeyed and fully invalidated.
    assert_eq!(
        h.nc.path_from_node(keep_node).tail_pointer(),
        keep_info.ptr
    );
    let keep_change = changes
        .iter()
        .find(|c| c.node == keep_node)
        .expect("change for kept file");
    assert_eq!(keep_change.file_updated, vec![dfs_types::WriteRange { off: 0, len: 0 }]);

    // The deleted file was unlinked; its handle no longer resolves to a
    // live path.
    assert!(h.nc.is_unlinked(gone_node));
    assert!(!h.nc.path_from_node(gone_node).is_valid());

    // The root produced a change too, and both survivors are affected.
    assert!(changes.iter().any(|c| c.node == h.root_node));
    assert!(affected.contains(&keep_node));

    // Reads flow through the new pointers.
    assert_eq!(h.read(keep_node, 5, 0), b"kk-v2");
}

#[test]
fn search_finds_nodes_and_paths() {
    let h = Harness::new(512, &[("a", b"1"), ("b", b"22")]);
    let a_info = h.seed_info("a");
    let root_ptr = h.md.root_entry.info.ptr;

    let cache: Arc<dyn NodeCache> = Arc::clone(&h.nc) as Arc<dyn NodeCache>;
    let mut new_ptrs = HashSet::new();
    new_ptrs.insert(root_ptr);

    let (nodes, _cache) = h
        .eng
        .search_for_nodes(&h.cx, Arc::clone(&cache), &[a_info.ptr], &new_ptrs, &h.md, root_ptr)
        .expect("search");
    let node = nodes[&a_info.ptr].expect("found node");
    assert_eq!(h.nc.path_from_node(node).tail_name(), "a");

    let paths = h
        .eng
        .search_for_paths(&h.cx, cache, &[a_info.ptr], &new_ptrs, &h.md, root_ptr)
        .expect("paths");
    assert_eq!(paths[&a_info.ptr].tail_pointer(), a_info.ptr);
}

#[test]
fn search_retries_on_stale_cache() {
    let h = Harness::new(512, &[("a", b"1")]);
    let a_info = h.seed_info("a");

    // Publish a new root revision the live node cache has never heard
    // about; searching it must fall back to a throwaway cache rather
    // than pollute the live one.
    let mut md2 = h.md.clone();
    md2.revision += 1;
    let root_block = h
        .eng
        .get_dirty_dir(
            &h.cx,
            &LockState::new(),
            &h.md,
            &h.root_path,
            dfs_engine::BlockReqType::Read,
        )
        .expect("root block");
    let republished = Block::Dir(root_block);
    let (new_root_info, _, root_ready) = ready_block(
        &h.cx,
        TLF,
        &md2,
        h.bcache.as_ref(),
        h.bops.as_ref(),
        &h.crypto,
        &republished,
        h.user,
    )
    .expect("ready republished root");
    let mut new_root_ptr = new_root_info.ptr;
    // Distinguish it from the original even though the contents match.
    new_root_ptr.ref_nonce = h.crypto.block_ref_nonce();
    h.server
        .put(new_root_ptr.id, new_root_ptr.ref_nonce, root_ready.buf);
    h.bcache
        .put(
            TLF,
            new_root_ptr,
            republished,
            new_root_info.encoded_size,
            CacheLifetime::Transient,
        )
        .expect("cache republished root");
    md2.root_entry.info.ptr = new_root_ptr;

    let live: Arc<dyn NodeCache> = Arc::clone(&h.nc) as Arc<dyn NodeCache>;
    let (nodes, cache) = h
        .eng
        .search_for_nodes(
            &h.cx,
            live,
            &[a_info.ptr],
            &HashSet::from([new_root_ptr]),
            &md2,
            new_root_ptr,
        )
        .expect("search with stale live cache");
    let node = nodes[&a_info.ptr].expect("found");
    assert_eq!(cache.path_from_node(node).tail_name(), "a");
    // The stale live cache was left untouched: it still resolves the
    // old root, and never learned the new one.
    assert!(h.nc.get(new_root_ptr.as_ref()).is_none());
    assert!(!Arc::ptr_eq(&cache, &(Arc::clone(&h.nc) as Arc<dyn NodeCache>)));
}

#[test]
fn size_sum_ignores_recoverable_errors_for_ignored_ptrs() {
    let h = Harness::new(512, &[("a", b"four"), ("b", b"eight!!!")]);
    let ls = LockState::new();
    let a = h.seed_info("a");
    let b = h.seed_info("b");

    // A pointer the server never stored.
    let mut missing = a.ptr;
    missing.id = dfs_types::BlockId([0xEE; 32]);

    let all = [a.ptr, b.ptr];
    let sum = h
        .eng
        .get_clean_encoded_blocks_size_sum(&h.cx, &ls, &h.md, &all, &HashSet::new())
        .expect("sum of clean blocks");
    assert_eq!(sum, u64::from(a.encoded_size) + u64::from(b.encoded_size));

    // The missing pointer fails the sweep unless it is ignorable.
    let with_missing = [a.ptr, b.ptr, missing];
    let err = h
        .eng
        .get_clean_encoded_blocks_size_sum(&h.cx, &ls, &h.md, &with_missing, &HashSet::new())
        .expect_err("missing block should fail");
    assert!(err.is_recoverable_for_removal());

    let ignore: HashSet<BlockPointer> = HashSet::from([missing]);
    let sum = h
        .eng
        .get_clean_encoded_blocks_size_sum(&h.cx, &ls, &h.md, &with_missing, &ignore)
        .expect("sum ignoring missing");
    assert_eq!(sum, u64::from(a.encoded_size) + u64::from(b.encoded_size));
}

#[test]
fn invalid_pointer_is_rejected_by_reads() {
    let h = Harness::new(512, &[]);
    let ls = LockState::new();
    let err = h
        .eng
        .get_block_for_reading(&h.cx, &ls, &h.md, BlockPointer::default())
        .expect_err("invalid pointer");
    assert!(matches!(err, EngineError::InvalidBlockRef { .. }));
}

#[test]
fn wrong_block_shape_is_rejected() {
    let h = Harness::new(512, &[("f", b"data")]);
    let (_, path) = h.file("f");
    let ls = LockState::new();
    let err = h
        .eng
        .get_dir_block_for_reading(&h.cx, &ls, &h.md, path.tail_pointer(), &h.root_path)
        .expect_err("file block is not a dir block");
    assert!(matches!(err, EngineError::NotDirBlock { .. }));

    let root_ptr = h.md.root_entry.info.ptr;
    let err = h
        .eng
        .get_file_block_for_reading(&h.cx, &ls, &h.md, root_ptr, &path)
        .expect_err("dir block is not a file block");
    assert!(matches!(err, EngineError::NotFileBlock { .. }));
}

#[test]
fn deep_copy_file_lands_in_scratch_cache() {
    let h = Harness::new(4, &[("f", b"")]);
    let (node, path) = h.file("f");
    h.write(node, b"0123456789", 0);

    let ls = LockState::new();
    let mut lbc = dfs_block::LocalBlockCache::new();
    let (new_top, children) = h
        .eng
        .deep_copy_file(&h.cx, &ls, &h.md, &path, &mut lbc)
        .expect("deep copy");
    assert_ne!(new_top, path.tail_pointer());
    assert_eq!(children.len(), 3);
    assert!(lbc.contains(new_top));
    for child in &children {
        assert!(lbc.contains(*child));
    }
    // The live dirty cache was not touched by the copy.
    assert_eq!(h.read(node, 10, 0), b"0123456789");
}

#[test]
fn data_version_too_new_is_rejected() {
    let h = Harness::new(512, &[("f", b"x")]);
    let (_, path) = h.file("f");
    let ls = LockState::new();
    let mut ptr = path.tail_pointer();
    ptr.data_ver = dfs_types::DataVer(99);
    ptr.id = dfs_types::BlockId([0xAB; 32]);
    let err = h
        .eng
        .get_file_block_for_reading(&h.cx, &ls, &h.md, ptr, &path)
        .expect_err("version too new");
    assert!(matches!(err, EngineError::DataVersionTooNew { .. }));
}

