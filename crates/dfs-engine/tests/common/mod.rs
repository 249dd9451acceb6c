//! Shared harness for engine end-to-end tests: an in-memory block store,
//! caches, a seeded folder, and a driver for the caller-side phases of a
//! sync (upload, top-block ready, metadata commit).

use asupersync::Cx;
use dfs_block::{BlockCache, BlockCacheStandard, BlockCrypto, BlockOps, BlockOpsStandard,
                BlockStoreServer, CacheLifetime, Codec, DirtyBlockCacheStandard,
                FixedBlockSplitter, LocalBlockCache, NoopReporter, RecordingJournal,
                StaticSessionProvider, TestClock};
use dfs_engine::{EngineConfig, FolderBlocks, LockState, Node, NodeCache, NodeCacheStandard,
                 StartSyncResult, ready_block};
use dfs_types::{Block, BlockInfo, BranchName, DataVer, DirBlock, DirEntry, EntryType, FileBlock,
                FolderBranch, FolderMetadata, FolderOp, FolderPath, KeyGen, MergeStatus,
                PathNode, TlfId, UserId};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, sync_channel};

pub struct Harness {
    pub cx: Cx,
    pub eng: FolderBlocks,
    pub md: FolderMetadata,
    pub server: Arc<BlockStoreServer>,
    pub bops: Arc<BlockOpsStandard>,
    pub bcache: Arc<BlockCacheStandard>,
    pub dirty: Arc<DirtyBlockCacheStandard>,
    pub nc: Arc<NodeCacheStandard>,
    pub journal: Arc<RecordingJournal>,
    pub clock: Arc<TestClock>,
    pub crypto: BlockCrypto,
    pub root_node: Node,
    pub root_path: FolderPath,
    pub user: UserId,
    pub force_rx: Receiver<()>,
}

pub const TLF: TlfId = TlfId(1);

impl Harness {
    /// A folder seeded with the given files, using small blocks so
    /// indirection kicks in early.
    pub fn new(max_block: usize, files: &[(&str, &[u8])]) -> Self {
        Self::with_dirty_cap(max_block, files, 1 << 24)
    }

    pub fn with_dirty_cap(max_block: usize, files: &[(&str, &[u8])], cap: i64) -> Self {
        let cx = Cx::for_testing();
        let crypto = BlockCrypto;
        let server = Arc::new(BlockStoreServer::new());
        let bops = Arc::new(BlockOpsStandard::new(Arc::clone(&server)));
        let bcache = Arc::new(BlockCacheStandard::new());
        let dirty = Arc::new(DirtyBlockCacheStandard::new(cap));
        let user = UserId(1);

        let mut md = FolderMetadata::default();
        md.tlf = TLF;
        md.revision = 1;
        md.merged = MergeStatus::Merged;
        md.key_gen = KeyGen::FIRST;
        md.writers = vec![user];

        let mut root_block = DirBlock::new_direct();
        for (name, contents) in files {
            let fb = Block::File(FileBlock::new_direct(contents.to_vec()));
            let (info, _, ready) = ready_block(
                &cx,
                TLF,
                &md,
                bcache.as_ref(),
                bops.as_ref(),
                &crypto,
                &fb,
                user,
            )
            .expect("ready seed file");
            server.put(info.ptr.id, info.ptr.ref_nonce, ready.buf);
            bcache
                .put(TLF, info.ptr, fb, info.encoded_size, CacheLifetime::Transient)
                .expect("cache seed file");
            root_block.children.insert(
                (*name).to_owned(),
                DirEntry {
                    info,
                    entry_type: EntryType::File,
                    size: contents.len() as u64,
                    mtime: 0,
                    ctime: 0,
                    sym_path: None,
                },
            );
        }
        let root = Block::Dir(root_block);
        let (root_info, _, root_ready) = ready_block(
            &cx,
            TLF,
            &md,
            bcache.as_ref(),
            bops.as_ref(),
            &crypto,
            &root,
            user,
        )
        .expect("ready root");
        server.put(root_info.ptr.id, root_info.ptr.ref_nonce, root_ready.buf);
        bcache
            .put(TLF, root_info.ptr, root, root_info.encoded_size, CacheLifetime::Transient)
            .expect("cache root");
        md.root_entry = DirEntry {
            info: root_info,
            entry_type: EntryType::Dir,
            size: files.len() as u64,
            mtime: 0,
            ctime: 0,
            sym_path: None,
        };

        let folder_branch = FolderBranch {
            tlf: TLF,
            branch: BranchName::master(),
        };
        let nc = Arc::new(NodeCacheStandard::new(folder_branch.clone()));
        let root_node = nc
            .get_or_create(root_info.ptr, "tlf", None)
            .expect("root node");
        let root_path = FolderPath::new(
            folder_branch.clone(),
            vec![PathNode {
                ptr: root_info.ptr,
                name: "tlf".to_owned(),
            }],
        );

        let journal = Arc::new(RecordingJournal::new());
        let clock = Arc::new(TestClock::new(1_000));
        let (force_tx, force_rx) = sync_channel(1);
        let config = Arc::new(EngineConfig {
            block_cache: Arc::clone(&bcache) as Arc<dyn dfs_block::BlockCache>,
            dirty_bcache: Arc::clone(&dirty) as Arc<dyn dfs_block::DirtyBlockCache>,
            block_ops: Arc::clone(&bops) as Arc<dyn dfs_block::BlockOps>,
            splitter: Arc::new(FixedBlockSplitter::new(max_block, 8, 64)),
            crypto,
            codec: Codec,
            reporter: Arc::new(NoopReporter),
            journal: Some(Arc::clone(&journal) as Arc<dyn dfs_block::DirtyOpJournal>),
            sessions: Arc::new(StaticSessionProvider::new(user, "alice")),
            clock: Arc::clone(&clock) as Arc<dyn dfs_block::Clock>,
            supported_data_version: DataVer::FILES_WITH_HOLES,
        });
        let eng = FolderBlocks::new(
            config,
            folder_branch,
            Arc::clone(&nc) as Arc<dyn NodeCache>,
            force_tx,
        );

        Self {
            cx,
            eng,
            md,
            server,
            bops,
            bcache,
            dirty,
            nc,
            journal,
            clock,
            crypto,
            root_node,
            root_path,
            user,
            force_rx,
        }
    }

    /// Resolve a seeded file into a node and its path.
    pub fn file(&self, name: &str) -> (Node, FolderPath) {
        let ls = LockState::new();
        let (node, _de) = self
            .eng
            .lookup(&self.cx, &ls, &self.md, self.root_node, name)
            .expect("lookup seeded file");
        let node = node.expect("seeded file is not a symlink");
        let path = self.nc.path_from_node(node);
        (node, path)
    }

    pub fn write(&self, node: Node, data: &[u8], off: u64) {
        let ls = LockState::new();
        self.eng
            .write(&self.cx, &ls, &self.md, node, data, off)
            .expect("write");
    }

    pub fn read(&self, node: Node, len: usize, off: u64) -> Vec<u8> {
        let ls = LockState::new();
        let mut buf = vec![0_u8; len];
        let n = self
            .eng
            .read(&self.cx, &ls, &self.md, node, &mut buf, off)
            .expect("read");
        buf.truncate(n);
        buf
    }

    pub fn entry(&self, path: &FolderPath) -> DirEntry {
        let ls = LockState::new();
        self.eng
            .get_entry(&self.cx, &ls, &self.md, path)
            .expect("get entry")
    }

    /// Drive phase two of a sync: upload the staged blocks, ready and
    /// upload the top block, commit the metadata, and produce the
    /// post-commit path.  Returns everything `finish_sync` needs.
    pub fn commit_sync(
        &mut self,
        file_path: &FolderPath,
        md: &mut FolderMetadata,
        res: &StartSyncResult,
    ) -> (FolderOp, FolderPath) {
        let ls = LockState::new();
        self.bops
            .put_blocks(&self.cx, TLF, &res.bps)
            .expect("upload staged blocks");
        // Cache the uploaded blocks like the block-put phase would.
        for bs in &res.bps.block_states {
            self.bcache
                .put(
                    TLF,
                    bs.ptr,
                    bs.block.clone(),
                    bs.ready.encoded_size(),
                    CacheLifetime::Permanent,
                )
                .expect("cache staged block");
        }

        let (top_info, _, top_ready) = ready_block(
            &self.cx,
            TLF,
            md,
            self.bcache.as_ref(),
            self.bops.as_ref(),
            &self.crypto,
            &Block::File(res.fblock.clone()),
            self.user,
        )
        .expect("ready top block");
        self.server
            .put(top_info.ptr.id, top_info.ptr.ref_nonce, top_ready.buf);
        md.add_update(file_path.tail_pointer(), top_info.ptr);
        md.add_ref_block(top_info);

        let mut new_de = res.dirty_de.clone();
        new_de.info = top_info;

        // Merge the new entry into the parent through a scratch cache and
        // publish the resulting directory blocks.
        let mut lbc = LocalBlockCache::new();
        self.eng
            .merge_dirty_entry_with_scratch(&self.cx, &ls, md, file_path, &mut lbc, new_de)
            .expect("merge dirty entry");
        let staged = lbc.take_all();
        assert_eq!(staged.len(), 1, "single-level parent expected");
        let (old_root_ptr, new_root_block) = staged.into_iter().next().expect("staged root");
        let (new_root_info, _, new_root_ready) = ready_block(
            &self.cx,
            TLF,
            md,
            self.bcache.as_ref(),
            self.bops.as_ref(),
            &self.crypto,
            &new_root_block,
            self.user,
        )
        .expect("ready new root");
        self.server.put(
            new_root_info.ptr.id,
            new_root_info.ptr.ref_nonce,
            new_root_ready.buf,
        );
        self.bcache
            .put(
                TLF,
                new_root_info.ptr,
                new_root_block,
                new_root_info.encoded_size,
                CacheLifetime::Transient,
            )
            .expect("cache new root");
        md.add_update(old_root_ptr, new_root_info.ptr);
        md.root_entry.info = new_root_info;

        let new_path = FolderPath::new(
            file_path.folder_branch.clone(),
            vec![
                PathNode {
                    ptr: new_root_info.ptr,
                    name: "tlf".to_owned(),
                },
                PathNode {
                    ptr: top_info.ptr,
                    name: file_path.tail_name().to_owned(),
                },
            ],
        );
        let op = md.ops.last().expect("sync op recorded").clone();
        (op, new_path)
    }

    /// Run a whole successful sync for one file.  Returns the new path
    /// and whether deferred writes left the file dirty.
    pub fn drive_successful_sync(&mut self, file_path: &FolderPath) -> (FolderPath, bool) {
        let ls = LockState::new();
        let mut md = self.md.clone();
        md.revision += 1;
        let res = self
            .eng
            .start_sync(&self.cx, &ls, &mut md, file_path)
            .expect("start sync");
        let (op, new_path) = self.commit_sync(file_path, &mut md, &res);
        let (_affected, still_dirty) = self
            .eng
            .finish_sync(&self.cx, &ls, &md, &op, file_path, &new_path, &res.sync_state)
            .expect("finish sync");
        self.eng
            .cleanup_sync_state(&self.cx, &ls, &md, file_path, &[], &res.sync_state, None);
        self.md = md;
        self.root_path.nodes[0].ptr = self.md.root_entry.info.ptr;
        (new_path, still_dirty)
    }

    pub fn seed_info(&self, name: &str) -> BlockInfo {
        let ls = LockState::new();
        self.eng
            .get_entry(&self.cx, &ls, &self.md, &self.root_path.child_path_no_ptr(name))
            .expect("seed entry")
            .info
    }
}
