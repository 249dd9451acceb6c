//! Dirty block cache.
//!
//! Holds every locally modified block until its folder syncs, enforces a
//! system-wide dirty byte cap through an admission channel, and signals
//! when a folder has built up enough dirty data to force a sync.

use asupersync::Cx;
use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockPointer, BranchName, TlfId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Fraction of the byte cap past which a folder should force a sync.
const FORCE_SYNC_NUMERATOR: i64 = 1;
const FORCE_SYNC_DENOMINATOR: i64 = 2;

/// Poll interval while waiting on admission or listener channels.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct PermShared {
    granted: Mutex<bool>,
    cv: Condvar,
}

/// Admission grant handle returned by `request_permission_to_dirty`.
///
/// The writer blocks on [`DirtyPermission::wait`] until the cache frees
/// enough bytes; cancellation is observed through the context.
#[derive(Debug, Clone)]
pub struct DirtyPermission {
    shared: Arc<PermShared>,
}

impl DirtyPermission {
    fn new_granted(granted: bool) -> (Self, Arc<PermShared>) {
        let shared = Arc::new(PermShared {
            granted: Mutex::new(granted),
            cv: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            shared,
        )
    }

    #[must_use]
    pub fn try_granted(&self) -> bool {
        *self.shared.granted.lock()
    }

    /// Block until granted or the context is cancelled.
    pub fn wait(&self, cx: &Cx) -> Result<()> {
        let mut granted = self.shared.granted.lock();
        loop {
            if *granted {
                return Ok(());
            }
            cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
            let _ = self
                .shared
                .cv
                .wait_for(&mut granted, WAIT_POLL_INTERVAL);
        }
    }

    /// Wait up to `timeout` for a grant; returns the granted state.
    pub fn wait_granted_for(&self, timeout: Duration) -> bool {
        let mut granted = self.shared.granted.lock();
        if *granted {
            return true;
        }
        let _ = self.shared.cv.wait_for(&mut granted, timeout);
        *granted
    }
}

fn grant(shared: &PermShared) {
    let mut granted = shared.granted.lock();
    *granted = true;
    shared.cv.notify_all();
}

/// Dirty block cache interface consumed by the engine.
pub trait DirtyBlockCache: Send + Sync {
    fn get(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> Result<Block>;
    fn put(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName, block: Block) -> Result<()>;
    fn delete(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> Result<()>;
    fn is_dirty(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> bool;

    /// Reserve `bytes` of dirty budget; the returned handle becomes granted
    /// once the reservation fits under the cap.
    fn request_permission_to_dirty(
        &self,
        cx: &Cx,
        tlf: TlfId,
        bytes: i64,
    ) -> Result<DirtyPermission>;

    /// Adjust the unsynced byte count; negative deltas release budget and
    /// may unblock queued writers.
    fn update_unsynced_bytes(&self, tlf: TlfId, bytes: i64, was_synced: bool);

    /// Bytes transitioning into the in-flight (syncing) state.
    fn update_syncing_bytes(&self, tlf: TlfId, bytes: i64);

    /// A whole file sync finished; `bytes` of dirty data became clean.
    fn sync_finished(&self, tlf: TlfId, bytes: i64);

    /// True when the folder has enough dirty bytes that the sync driver
    /// should be poked.
    fn should_force_sync(&self, tlf: TlfId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DirtyKey {
    tlf: TlfId,
    ptr: BlockPointer,
    branch: BranchName,
}

#[derive(Default)]
struct DirtyState {
    blocks: HashMap<DirtyKey, Block>,
    unsynced_bytes: i64,
    syncing_bytes: i64,
    waiters: VecDeque<(i64, Arc<PermShared>)>,
}

/// In-memory dirty cache with a fixed byte cap.
pub struct DirtyBlockCacheStandard {
    state: Mutex<DirtyState>,
    sync_buf_cap: i64,
}

impl DirtyBlockCacheStandard {
    #[must_use]
    pub fn new(sync_buf_cap: i64) -> Self {
        Self {
            state: Mutex::new(DirtyState::default()),
            sync_buf_cap: sync_buf_cap.max(1),
        }
    }

    fn key(tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> DirtyKey {
        DirtyKey {
            tlf,
            ptr,
            branch: branch.clone(),
        }
    }

    fn drain_waiters(&self, state: &mut DirtyState) {
        loop {
            let Some((bytes, _)) = state.waiters.front() else {
                break;
            };
            let bytes = *bytes;
            let fits =
                state.unsynced_bytes == 0 || state.unsynced_bytes + bytes <= self.sync_buf_cap;
            if !fits {
                break;
            }
            let Some((bytes, shared)) = state.waiters.pop_front() else {
                break;
            };
            state.unsynced_bytes += bytes;
            grant(&shared);
            trace!(event = "dirty_admission_granted", bytes);
        }
    }

    /// Total unsynced bytes, exposed for tests and metrics.
    #[must_use]
    pub fn unsynced_bytes(&self) -> i64 {
        self.state.lock().unsynced_bytes
    }

    /// Number of dirty blocks currently held.
    #[must_use]
    pub fn dirty_block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }
}

impl DirtyBlockCache for DirtyBlockCacheStandard {
    fn get(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> Result<Block> {
        self.state
            .lock()
            .blocks
            .get(&Self::key(tlf, ptr, branch))
            .cloned()
            .ok_or_else(|| EngineError::BlockNotFound {
                id: ptr.id.to_string(),
            })
    }

    fn put(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName, block: Block) -> Result<()> {
        self.state
            .lock()
            .blocks
            .insert(Self::key(tlf, ptr, branch), block);
        Ok(())
    }

    fn delete(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> Result<()> {
        self.state.lock().blocks.remove(&Self::key(tlf, ptr, branch));
        Ok(())
    }

    fn is_dirty(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> bool {
        self.state
            .lock()
            .blocks
            .contains_key(&Self::key(tlf, ptr, branch))
    }

    fn request_permission_to_dirty(
        &self,
        cx: &Cx,
        _tlf: TlfId,
        bytes: i64,
    ) -> Result<DirtyPermission> {
        cx.checkpoint().map_err(|_| EngineError::Cancelled)?;
        if bytes < 0 {
            return Err(EngineError::DirtyAdmission(format!(
                "negative byte request: {bytes}"
            )));
        }
        let mut state = self.state.lock();
        let idle = state.waiters.is_empty();
        let fits =
            state.unsynced_bytes == 0 || state.unsynced_bytes + bytes <= self.sync_buf_cap;
        if idle && fits {
            state.unsynced_bytes += bytes;
            let (perm, _) = DirtyPermission::new_granted(true);
            return Ok(perm);
        }
        debug!(event = "dirty_admission_queued", bytes, unsynced = state.unsynced_bytes);
        let (perm, shared) = DirtyPermission::new_granted(false);
        state.waiters.push_back((bytes, shared));
        Ok(perm)
    }

    fn update_unsynced_bytes(&self, _tlf: TlfId, bytes: i64, _was_synced: bool) {
        let mut state = self.state.lock();
        state.unsynced_bytes = (state.unsynced_bytes + bytes).max(0);
        if bytes < 0 {
            self.drain_waiters(&mut state);
        }
    }

    fn update_syncing_bytes(&self, _tlf: TlfId, bytes: i64) {
        let mut state = self.state.lock();
        state.syncing_bytes = (state.syncing_bytes + bytes).max(0);
    }

    fn sync_finished(&self, _tlf: TlfId, bytes: i64) {
        let mut state = self.state.lock();
        state.unsynced_bytes = (state.unsynced_bytes - bytes.max(0)).max(0);
        state.syncing_bytes = (state.syncing_bytes - bytes.max(0)).max(0);
        self.drain_waiters(&mut state);
    }

    fn should_force_sync(&self, _tlf: TlfId) -> bool {
        let state = self.state.lock();
        state.unsynced_bytes * FORCE_SYNC_DENOMINATOR > self.sync_buf_cap * FORCE_SYNC_NUMERATOR
    }
}

/// Scratch block cache used while staging a sync.
///
/// Reads fall through to the live caches but copies land here, so the live
/// dirty cache is never mutated during staging.  Not thread-safe; callers
/// hold the folder's block lock.
#[derive(Debug, Default)]
pub struct LocalBlockCache {
    blocks: HashMap<BlockPointer, Block>,
}

impl LocalBlockCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, ptr: BlockPointer) -> Option<&Block> {
        self.blocks.get(&ptr)
    }

    pub fn put(&mut self, ptr: BlockPointer, block: Block) {
        self.blocks.insert(ptr, block);
    }

    #[must_use]
    pub fn contains(&self, ptr: BlockPointer) -> bool {
        self.blocks.contains_key(&ptr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drain all staged blocks for the caller to flush.
    pub fn take_all(&mut self) -> Vec<(BlockPointer, Block)> {
        self.blocks.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::{BlockId, DataVer, FileBlock, KeyGen};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn ptr(b: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId([b; 32]),
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            ..BlockPointer::default()
        }
    }

    fn block(data: &[u8]) -> Block {
        Block::File(FileBlock::new_direct(data.to_vec()))
    }

    #[test]
    fn put_get_delete_round_trip() {
        let cache = DirtyBlockCacheStandard::new(1024);
        let branch = BranchName::master();
        let tlf = TlfId(1);
        assert!(!cache.is_dirty(tlf, ptr(1), &branch));
        cache.put(tlf, ptr(1), &branch, block(b"x")).unwrap();
        assert!(cache.is_dirty(tlf, ptr(1), &branch));
        assert_eq!(cache.get(tlf, ptr(1), &branch).unwrap(), block(b"x"));
        cache.delete(tlf, ptr(1), &branch).unwrap();
        assert!(!cache.is_dirty(tlf, ptr(1), &branch));
    }

    #[test]
    fn admission_grants_immediately_under_cap() {
        let cx = Cx::for_testing();
        let cache = DirtyBlockCacheStandard::new(100);
        let perm = cache
            .request_permission_to_dirty(&cx, TlfId(1), 40)
            .unwrap();
        assert!(perm.try_granted());
        assert_eq!(cache.unsynced_bytes(), 40);
        cache.update_unsynced_bytes(TlfId(1), -40, false);
        assert_eq!(cache.unsynced_bytes(), 0);
    }

    #[test]
    fn admission_blocks_until_bytes_freed() {
        let cx = Cx::for_testing();
        let cache = Arc::new(DirtyBlockCacheStandard::new(100));
        let first = cache
            .request_permission_to_dirty(&cx, TlfId(1), 90)
            .unwrap();
        assert!(first.try_granted());
        let second = cache
            .request_permission_to_dirty(&cx, TlfId(1), 50)
            .unwrap();
        assert!(!second.try_granted());

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let cache = Arc::clone(&cache);
            let second = second.clone();
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let cx = Cx::for_testing();
                second.wait(&cx).unwrap();
                assert!(released.load(Ordering::SeqCst));
                assert!(cache.unsynced_bytes() >= 50);
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        released.store(true, Ordering::SeqCst);
        cache.update_unsynced_bytes(TlfId(1), -90, false);
        waiter.join().expect("waiter thread");
    }

    #[test]
    fn oversized_request_granted_when_idle() {
        let cx = Cx::for_testing();
        let cache = DirtyBlockCacheStandard::new(10);
        // Larger than the cap, but nothing else is outstanding.
        let perm = cache
            .request_permission_to_dirty(&cx, TlfId(1), 50)
            .unwrap();
        assert!(perm.try_granted());
    }

    #[test]
    fn force_sync_watermark() {
        let cx = Cx::for_testing();
        let cache = DirtyBlockCacheStandard::new(100);
        assert!(!cache.should_force_sync(TlfId(1)));
        let _perm = cache
            .request_permission_to_dirty(&cx, TlfId(1), 60)
            .unwrap();
        assert!(cache.should_force_sync(TlfId(1)));
        cache.sync_finished(TlfId(1), 60);
        assert!(!cache.should_force_sync(TlfId(1)));
    }

    #[test]
    fn wait_observes_grant_quickly() {
        let cx = Cx::for_testing();
        let cache = Arc::new(DirtyBlockCacheStandard::new(10));
        let first = cache.request_permission_to_dirty(&cx, TlfId(1), 8).unwrap();
        assert!(first.try_granted());
        let blocked = cache.request_permission_to_dirty(&cx, TlfId(1), 8).unwrap();

        let handle = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cache.update_unsynced_bytes(TlfId(1), -8, false);
            })
        };
        let start = Instant::now();
        blocked.wait(&cx).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().expect("release thread");
    }

    #[test]
    fn local_block_cache_stages_blocks() {
        let mut lbc = LocalBlockCache::new();
        assert!(lbc.is_empty());
        lbc.put(ptr(1), block(b"a"));
        assert!(lbc.contains(ptr(1)));
        assert_eq!(lbc.get(ptr(1)), Some(&block(b"a")));
        let all = lbc.take_all();
        assert_eq!(all.len(), 1);
        assert!(lbc.is_empty());
    }
}
