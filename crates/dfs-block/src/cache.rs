//! Clean block cache.
//!
//! Content-addressed cache of published blocks, with a dedup index over
//! direct file block contents and a prefetcher notification hook.  Entries
//! are keyed by block ID; the cache never holds dirty data.

use dfs_error::{EngineError, Result};
use dfs_types::{Block, BlockId, BlockPointer, FileBlock, TlfId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// How long a cached block should be retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLifetime {
    /// Do not cache at all.
    NoCache,
    /// Evictable entry.
    Transient,
    /// Pinned until explicitly deleted.
    Permanent,
}

/// Prefetch progress recorded for a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefetchStatus {
    #[default]
    NotStarted,
    Triggered,
}

/// Priority class for prefetch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchPriority {
    /// A block the user is waiting on right now.
    OnDemand,
    /// A block rekeyed by a pointer update.
    PointerUpdate,
}

/// Downstream block prefetcher.
pub trait Prefetcher: Send + Sync {
    /// Re-submit an already-fetched block so its children are considered
    /// for prefetching at the given priority.
    fn process_block_for_prefetch(&self, ptr: BlockPointer, priority: PrefetchPriority);

    /// Request a prefetch of a block that is not yet cached locally.
    fn request_prefetch(&self, ptr: BlockPointer, priority: PrefetchPriority);

    /// Drop any outstanding prefetch for the given ID.
    fn cancel_prefetch(&self, id: BlockId);
}

/// Prefetcher event log, enough to drive tests and tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchEvent {
    Process {
        ptr: BlockPointer,
        priority: PrefetchPriority,
    },
    Request {
        ptr: BlockPointer,
        priority: PrefetchPriority,
    },
    Cancel {
        id: BlockId,
    },
}

/// A prefetcher that records every request it receives.
#[derive(Debug, Default)]
pub struct RecordingPrefetcher {
    events: Mutex<Vec<PrefetchEvent>>,
}

impl RecordingPrefetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return all recorded events.
    pub fn drain_events(&self) -> Vec<PrefetchEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl Prefetcher for RecordingPrefetcher {
    fn process_block_for_prefetch(&self, ptr: BlockPointer, priority: PrefetchPriority) {
        trace!(event = "prefetch_process", ptr = %ptr);
        self.events.lock().push(PrefetchEvent::Process { ptr, priority });
    }

    fn request_prefetch(&self, ptr: BlockPointer, priority: PrefetchPriority) {
        trace!(event = "prefetch_request", ptr = %ptr);
        self.events.lock().push(PrefetchEvent::Request { ptr, priority });
    }

    fn cancel_prefetch(&self, id: BlockId) {
        trace!(event = "prefetch_cancel", id = %id);
        self.events.lock().push(PrefetchEvent::Cancel { id });
    }
}

/// Clean block cache interface consumed by the engine.
pub trait BlockCache: Send + Sync {
    /// Fetch a cached block by pointer.
    fn get(&self, ptr: BlockPointer) -> Result<Block>;

    /// Encoded size of a cached block.
    fn get_encoded_size(&self, ptr: BlockPointer) -> Result<u32>;

    /// Fetch along with the prefetch bookkeeping for the entry.
    fn get_with_prefetch(&self, ptr: BlockPointer)
        -> Result<(Block, PrefetchStatus, CacheLifetime)>;

    /// Insert a clean block.
    fn put(
        &self,
        tlf: TlfId,
        ptr: BlockPointer,
        block: Block,
        encoded_size: u32,
        lifetime: CacheLifetime,
    ) -> Result<()>;

    /// Look for an existing pointer whose direct contents equal `block`'s.
    fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Result<Option<BlockPointer>>;

    /// Remove a permanent entry once its block lives in the remote store.
    fn delete_permanent(&self, id: BlockId) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    block: Block,
    encoded_size: u32,
    lifetime: CacheLifetime,
    prefetch: PrefetchStatus,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<BlockId, CacheEntry>,
    /// blake3(direct file contents) -> pointer, for block dedup.
    dedup: HashMap<(TlfId, [u8; 32]), BlockPointer>,
}

/// In-memory clean cache.
#[derive(Default)]
pub struct BlockCacheStandard {
    state: Mutex<CacheState>,
}

impl BlockCacheStandard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn not_cached(ptr: BlockPointer) -> EngineError {
        EngineError::BlockNotFound {
            id: ptr.id.to_string(),
        }
    }
}

impl BlockCache for BlockCacheStandard {
    fn get(&self, ptr: BlockPointer) -> Result<Block> {
        let state = self.state.lock();
        state
            .entries
            .get(&ptr.id)
            .map(|e| e.block.clone())
            .ok_or_else(|| Self::not_cached(ptr))
    }

    fn get_encoded_size(&self, ptr: BlockPointer) -> Result<u32> {
        let state = self.state.lock();
        state
            .entries
            .get(&ptr.id)
            .map(|e| e.encoded_size)
            .ok_or_else(|| Self::not_cached(ptr))
    }

    fn get_with_prefetch(
        &self,
        ptr: BlockPointer,
    ) -> Result<(Block, PrefetchStatus, CacheLifetime)> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&ptr.id)
            .ok_or_else(|| Self::not_cached(ptr))?;
        let status = entry.prefetch;
        entry.prefetch = PrefetchStatus::Triggered;
        Ok((entry.block.clone(), status, entry.lifetime))
    }

    fn put(
        &self,
        tlf: TlfId,
        ptr: BlockPointer,
        block: Block,
        encoded_size: u32,
        lifetime: CacheLifetime,
    ) -> Result<()> {
        if matches!(lifetime, CacheLifetime::NoCache) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if let Block::File(fb) = &block {
            if !fb.is_indirect && !fb.contents.is_empty() {
                let hash = *blake3::hash(&fb.contents).as_bytes();
                state.dedup.insert((tlf, hash), ptr);
            }
        }
        state.entries.insert(
            ptr.id,
            CacheEntry {
                block,
                encoded_size,
                lifetime,
                prefetch: PrefetchStatus::NotStarted,
            },
        );
        Ok(())
    }

    fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Result<Option<BlockPointer>> {
        if block.is_indirect || block.contents.is_empty() {
            return Ok(None);
        }
        let hash = *blake3::hash(&block.contents).as_bytes();
        let state = self.state.lock();
        let ptr = state.dedup.get(&(tlf, hash)).copied();
        // Only report pointers whose blocks are still resident.
        Ok(ptr.filter(|p| state.entries.contains_key(&p.id)))
    }

    fn delete_permanent(&self, id: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.remove(&id);
        state.dedup.retain(|_, ptr| ptr.id != id);
        Ok(())
    }
}
