//! Change operations recorded against folder metadata.
//!
//! A sync op accumulates the writes and truncates applied to one file
//! between publications; rename and setattr ops describe directory-level
//! changes.  All ops carry ref/unref/update lists used for quota accounting
//! and cleanup of failed publications.

use crate::{BlockPointer, EntryType, FolderPath};
use serde::{Deserialize, Serialize};

/// A half-open byte range affected by a write, or a truncation point.
///
/// A zero-length range marks a truncation at `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
}

impl WriteRange {
    #[must_use]
    pub fn write(off: u64, len: u64) -> Self {
        Self { off, len }
    }

    #[must_use]
    pub fn truncate(off: u64) -> Self {
        Self { off, len: 0 }
    }

    #[must_use]
    pub fn is_truncate(self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn end(self) -> u64 {
        self.off.saturating_add(self.len)
    }
}

/// An old-pointer to new-pointer transition recorded in an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockUpdate {
    pub old_ptr: BlockPointer,
    pub new_ptr: BlockPointer,
}

/// Collapse an issue-ordered list of writes and truncates to a minimal
/// equivalent set: overlapping and adjacent writes coalesce, a truncate
/// clamps or drops writes past its cut and supersedes earlier truncates,
/// and the degenerate `{0, 0}` entry produced by an empty write vanishes.
#[must_use]
pub fn collapse_write_ranges(writes: &[WriteRange]) -> Vec<WriteRange> {
    let mut ranges: Vec<WriteRange> = Vec::new();
    let mut truncate: Option<u64> = None;
    for w in writes {
        if w.off == 0 && w.len == 0 {
            continue;
        }
        if w.is_truncate() {
            ranges.retain(|r| r.off < w.off);
            for r in &mut ranges {
                if r.end() > w.off {
                    r.len = w.off - r.off;
                }
            }
            truncate = Some(w.off);
        } else {
            let mut merged = *w;
            let mut keep: Vec<WriteRange> = Vec::with_capacity(ranges.len());
            for r in ranges.drain(..) {
                if r.off <= merged.end() && merged.off <= r.end() {
                    let start = merged.off.min(r.off);
                    let end = merged.end().max(r.end());
                    merged = WriteRange::write(start, end - start);
                } else {
                    keep.push(r);
                }
            }
            ranges = keep;
            let pos = ranges.partition_point(|r| r.off < merged.off);
            ranges.insert(pos, merged);
        }
    }
    if let Some(off) = truncate {
        ranges.push(WriteRange::truncate(off));
    }
    ranges
}

/// The accumulating record of one file's writes between syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncOp {
    /// Old-to-new transition of the file's tail pointer.
    pub target: BlockUpdate,
    pub writes: Vec<WriteRange>,
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
    pub final_path: Option<FolderPath>,
}

impl SyncOp {
    #[must_use]
    pub fn new(tail: BlockPointer) -> Self {
        Self {
            target: BlockUpdate {
                old_ptr: tail,
                new_ptr: BlockPointer::default(),
            },
            ..Self::default()
        }
    }

    pub fn add_write(&mut self, off: u64, len: u64) -> WriteRange {
        let w = WriteRange::write(off, len);
        self.writes.push(w);
        w
    }

    pub fn add_truncate(&mut self, size: u64) -> WriteRange {
        let w = WriteRange::truncate(size);
        self.writes.push(w);
        w
    }

    pub fn collapse_writes(&mut self) {
        self.writes = collapse_write_ranges(&self.writes);
    }

    pub fn add_ref_block(&mut self, ptr: BlockPointer) {
        self.refs.push(ptr);
    }

    pub fn add_unref_block(&mut self, ptr: BlockPointer) {
        self.unrefs.push(ptr);
    }

    pub fn add_update(&mut self, old_ptr: BlockPointer, new_ptr: BlockPointer) {
        if self.target.old_ptr == old_ptr {
            self.target.new_ptr = new_ptr;
            return;
        }
        self.updates.push(BlockUpdate { old_ptr, new_ptr });
    }

    pub fn set_final_path(&mut self, path: FolderPath) {
        self.final_path = Some(path);
    }

    /// Every pointer transition carried by this op, the target included.
    #[must_use]
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut all = Vec::with_capacity(self.updates.len() + 1);
        if self.target.new_ptr.is_initialized() {
            all.push(self.target);
        }
        all.extend_from_slice(&self.updates);
        all
    }

    /// Drop accumulated pointer updates so the op can be reused by a retry.
    pub fn reset_update_state(&mut self) {
        self.updates.clear();
        self.target.new_ptr = BlockPointer::default();
    }
}

/// Attribute selector for setattr ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrChange {
    Exec,
    Mtime,
}

/// A directory-entry attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttrOp {
    pub name: String,
    pub dir: BlockUpdate,
    pub attr: AttrChange,
    pub file: BlockPointer,
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
}

impl SetAttrOp {
    #[must_use]
    pub fn new(name: &str, dir_ptr: BlockPointer, attr: AttrChange, file: BlockPointer) -> Self {
        Self {
            name: name.to_owned(),
            dir: BlockUpdate {
                old_ptr: dir_ptr,
                new_ptr: BlockPointer::default(),
            },
            attr,
            file,
            refs: Vec::new(),
            unrefs: Vec::new(),
            updates: Vec::new(),
        }
    }
}

/// A rename between (possibly identical) parent directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameOp {
    pub old_name: String,
    pub old_dir: BlockUpdate,
    pub new_name: String,
    /// Absent when source and destination directories are the same block.
    pub new_dir: Option<BlockUpdate>,
    pub renamed: BlockPointer,
    pub renamed_type: EntryType,
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
    pub final_path: Option<FolderPath>,
    pub old_final_path: Option<FolderPath>,
}

impl RenameOp {
    #[must_use]
    pub fn new(
        old_name: &str,
        old_dir: BlockPointer,
        new_name: &str,
        new_dir: BlockPointer,
        renamed: BlockPointer,
        renamed_type: EntryType,
    ) -> Self {
        let new_dir_update = if new_dir == old_dir {
            None
        } else {
            Some(BlockUpdate {
                old_ptr: new_dir,
                new_ptr: BlockPointer::default(),
            })
        };
        Self {
            old_name: old_name.to_owned(),
            old_dir: BlockUpdate {
                old_ptr: old_dir,
                new_ptr: BlockPointer::default(),
            },
            new_name: new_name.to_owned(),
            new_dir: new_dir_update,
            renamed,
            renamed_type,
            refs: Vec::new(),
            unrefs: Vec::new(),
            updates: Vec::new(),
            final_path: None,
            old_final_path: None,
        }
    }

    /// Record a pointer transition, routing parent-directory self-updates
    /// to the dedicated fields.
    pub fn add_update(&mut self, old_ptr: BlockPointer, new_ptr: BlockPointer) {
        if self.old_dir.old_ptr == old_ptr {
            self.old_dir.new_ptr = new_ptr;
            return;
        }
        if let Some(nd) = &mut self.new_dir {
            if nd.old_ptr == old_ptr {
                nd.new_ptr = new_ptr;
                return;
            }
        }
        self.updates.push(BlockUpdate { old_ptr, new_ptr });
    }

    #[must_use]
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut all = Vec::new();
        if self.old_dir.new_ptr.is_initialized() {
            all.push(self.old_dir);
        }
        if let Some(nd) = self.new_dir {
            if nd.new_ptr.is_initialized() {
                all.push(nd);
            }
        }
        all.extend_from_slice(&self.updates);
        all
    }
}
