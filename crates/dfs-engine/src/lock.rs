//! Reentrancy-checked folder block lock.
//!
//! The lock owns every registry that must only change under it.  Each
//! operation carries a `LockState` token recording the hold level it has
//! taken, which replaces thread-identity checks: a read fan-out worker
//! holds no token at all and cooperates under the coordinator's hold.

use crate::state::LockedState;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};

/// Kind of block request an operation is making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReqType {
    /// A plain read.
    Read,
    /// A read that will mutate the block; requires the write lock.
    Write,
    /// A read from a worker fan-out that holds no token of its own.
    ReadParallel,
    /// A read while materializing a node during a path walk; never
    /// releases the lock because it races pointer updates.
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldLevel {
    Read,
    Write,
}

/// Per-operation lock token.
///
/// Not shared across threads: fan-out workers run without one.
#[derive(Debug, Default)]
pub struct LockState {
    level: Cell<Option<HoldLevel>>,
    parallel_fanout: Cell<bool>,
}

impl LockState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn assert_not_held(&self) {
        assert!(
            self.level.get().is_none(),
            "block lock already held by this operation"
        );
    }

    pub(crate) fn assert_read_held(&self) {
        assert_eq!(
            self.level.get(),
            Some(HoldLevel::Read),
            "operation must hold the block lock for reading"
        );
    }

    pub(crate) fn assert_write_held(&self) {
        assert_eq!(
            self.level.get(),
            Some(HoldLevel::Write),
            "operation must hold the block lock for writing"
        );
    }

    pub(crate) fn assert_any_held(&self) {
        assert!(
            self.level.get().is_some(),
            "operation must hold the block lock"
        );
    }

    pub(crate) fn set_parallel_fanout(&self, fanout: bool) {
        self.parallel_fanout.set(fanout);
    }

    pub(crate) fn has_parallel_fanout(&self) -> bool {
        self.parallel_fanout.get()
    }
}

/// The folder's block lock, owning the guarded registries.
#[derive(Debug)]
pub(crate) struct BlockLock {
    inner: RwLock<LockedState>,
}

impl BlockLock {
    pub fn new(state: LockedState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    /// Acquire for reading.  Panics if the token already holds the lock.
    pub fn read<'a>(&'a self, ls: &'a LockState) -> ReadLockCtx<'a> {
        ls.assert_not_held();
        let guard = self.inner.read();
        ls.level.set(Some(HoldLevel::Read));
        ReadLockCtx { guard, ls }
    }

    /// Acquire for writing.  Panics if the token already holds the lock.
    pub fn write<'a>(&'a self, ls: &'a LockState) -> WriteLockCtx<'a> {
        ls.assert_not_held();
        let guard = self.inner.write();
        ls.level.set(Some(HoldLevel::Write));
        WriteLockCtx { guard, ls }
    }
}

/// Read hold on the block lock.
pub(crate) struct ReadLockCtx<'a> {
    guard: RwLockReadGuard<'a, LockedState>,
    ls: &'a LockState,
}

impl<'a> ReadLockCtx<'a> {
    /// Run `f` with the lock released, unless a worker fan-out is
    /// outstanding under this token, in which case `f` runs locked.
    pub fn with_unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.ls.assert_read_held();
        if self.ls.has_parallel_fanout() {
            return f();
        }
        RwLockReadGuard::unlocked(&mut self.guard, f)
    }
}

impl Deref for ReadLockCtx<'_> {
    type Target = LockedState;

    fn deref(&self) -> &LockedState {
        &self.guard
    }
}

impl Drop for ReadLockCtx<'_> {
    fn drop(&mut self) {
        self.ls.level.set(None);
    }
}

/// Write hold on the block lock.  Never released around I/O: the holder
/// is in the middle of an atomic write sequence.
pub(crate) struct WriteLockCtx<'a> {
    guard: RwLockWriteGuard<'a, LockedState>,
    ls: &'a LockState,
}

impl Deref for WriteLockCtx<'_> {
    type Target = LockedState;

    fn deref(&self) -> &LockedState {
        &self.guard
    }
}

impl DerefMut for WriteLockCtx<'_> {
    fn deref_mut(&mut self) -> &mut LockedState {
        &mut self.guard
    }
}

impl Drop for WriteLockCtx<'_> {
    fn drop(&mut self) {
        self.ls.level.set(None);
    }
}
