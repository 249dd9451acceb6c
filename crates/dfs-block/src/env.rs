//! Environment collaborators.
//!
//! Small interfaces the engine consumes from the surrounding system: read
//! notifications, session identity, the optional dirty-op journal, and the
//! clock used to stamp entry times.

use asupersync::Cx;
use dfs_error::Result;
use dfs_types::{FolderPath, TlfId, UserId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ── Read notifications ──────────────────────────────────────────────────────

/// Observer of read activity, for progress reporting.
pub trait Reporter: Send + Sync {
    /// Called at the start (`done == false`) and end (`done == true`) of a
    /// remote read for the given path.
    fn notify_read(&self, path: &FolderPath, done: bool);
}

/// Reporter that drops every notification.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn notify_read(&self, _path: &FolderPath, _done: bool) {}
}

/// Reporter that records (path, done) pairs for assertions.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<(String, bool)>>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain_events(&self) -> Vec<(String, bool)> {
        std::mem::take(&mut self.events.lock())
    }
}

impl Reporter for RecordingReporter {
    fn notify_read(&self, path: &FolderPath, done: bool) {
        self.events.lock().push((path.to_string(), done));
    }
}

// ── Sessions ────────────────────────────────────────────────────────────────

/// The identity driving the current operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: UserId,
    pub name: String,
}

/// Source of the current session.
pub trait SessionProvider: Send + Sync {
    fn current_session(&self, cx: &Cx) -> Result<Session>;
}

/// Fixed-identity session provider.
#[derive(Debug, Clone)]
pub struct StaticSessionProvider {
    session: Session,
}

impl StaticSessionProvider {
    #[must_use]
    pub fn new(user: UserId, name: &str) -> Self {
        Self {
            session: Session {
                user,
                name: name.to_owned(),
            },
        }
    }
}

impl SessionProvider for StaticSessionProvider {
    fn current_session(&self, _cx: &Cx) -> Result<Session> {
        Ok(self.session.clone())
    }
}

// ── Journal ─────────────────────────────────────────────────────────────────

/// Optional journal bracketing every dirty operation.
pub trait DirtyOpJournal: Send + Sync {
    fn dirty_op_start(&self, tlf: TlfId);
    fn dirty_op_end(&self, tlf: TlfId);
}

/// Journal that counts bracketing calls, for tests.
#[derive(Debug, Default)]
pub struct RecordingJournal {
    starts: AtomicI64,
    ends: AtomicI64,
}

impl RecordingJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn starts(&self) -> i64 {
        self.starts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn ends(&self) -> i64 {
        self.ends.load(Ordering::SeqCst)
    }
}

impl DirtyOpJournal for RecordingJournal {
    fn dirty_op_start(&self, _tlf: TlfId) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn dirty_op_end(&self, _tlf: TlfId) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Clock ───────────────────────────────────────────────────────────────────

/// Time source for mtime/ctime stamping.
pub trait Clock: Send + Sync {
    fn now_unix_nanos(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

/// Settable clock for deterministic tests.
#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    #[must_use]
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: i64) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_unix_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
