#![forbid(unsafe_code)]
//! Block-layer collaborators for the DriftFS dirty block engine.
//!
//! Provides the clean content-addressed block cache, the dirty block cache
//! with byte accounting and admission control, the block-ops interface with
//! an in-memory block server, the block splitter, the crypto helpers for
//! block IDs and ref-nonces, and the serialize-based codec.

mod cache;
mod codec;
mod crypto;
mod dirty;
mod env;
mod put;
mod server;
mod split;

pub use cache::{BlockCache, BlockCacheStandard, CacheLifetime, PrefetchEvent, PrefetchPriority,
                PrefetchStatus, Prefetcher, RecordingPrefetcher};
pub use codec::Codec;
pub use crypto::BlockCrypto;
pub use dirty::{DirtyBlockCache, DirtyBlockCacheStandard, DirtyPermission, LocalBlockCache};
pub use env::{Clock, DirtyOpJournal, NoopReporter, RecordingJournal, RecordingReporter,
              Reporter, Session, SessionProvider, StaticSessionProvider, SystemClock, TestClock};
pub use put::{BlockPutState, BlockState, ReadyBlockData};
pub use server::{BlockDeleteType, BlockOps, BlockOpsStandard, BlockStoreServer};
pub use split::{BlockSplitter, FixedBlockSplitter};
