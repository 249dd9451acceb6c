#![forbid(unsafe_code)]
//! Error types for DriftFS.
//!
//! Defines `EngineError` and a `Result<T>` alias used throughout the
//! workspace, plus the recoverability classifiers consumed by the sync
//! engine and by block-removal enumeration.

use thiserror::Error;

/// Unified error type for all DriftFS operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid block reference {ptr}")]
    InvalidBlockRef { ptr: String },

    #[error("invalid path {path}")]
    InvalidPath { path: String },

    #[error("block {ptr} is not a file block")]
    NotFileBlock { ptr: String },

    #[error("block {ptr} is not a directory block")]
    NotDirBlock { ptr: String },

    #[error("no such entry: {name}")]
    NoSuchName { name: String },

    #[error("entry already exists: {name}")]
    Exists { name: String },

    #[error("no sync operation found for file reference {reference}")]
    NoSyncOp { reference: String },

    #[error("user {user} is not a writer of folder {folder}")]
    WriteAccess { user: String, folder: String },

    #[error("block data version {found} exceeds supported version {supported}")]
    DataVersionTooNew { found: u32, supported: u32 },

    #[error("block {id} not found in the block store")]
    BlockNotFound { id: String },

    #[error("transient block server failure for {id}: {detail}")]
    TransientBlockServer { id: String, detail: String },

    #[error("block store failure: {0}")]
    BlockStore(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("node cache is out of date")]
    OutOfDateCache,

    #[error("no node found for pointer {ptr}")]
    NodeNotFound { ptr: String },

    #[error("dirty buffer admission failed: {0}")]
    DirtyAdmission(String),
}

impl EngineError {
    /// True when a failed sync may be retried after reverting to the saved
    /// pre-sync state.  Transient block server failures qualify; everything
    /// else is treated as unrecoverable by the sync engine.
    #[must_use]
    pub fn is_recoverable_block_error(&self) -> bool {
        matches!(self, Self::TransientBlockServer { .. })
    }

    /// True when the error may be ignored while enumerating blocks that are
    /// about to be removed anyway.  A missing block or a transient server
    /// failure should not abort a removal sweep.
    #[must_use]
    pub fn is_recoverable_for_removal(&self) -> bool {
        matches!(
            self,
            Self::BlockNotFound { .. } | Self::TransientBlockServer { .. }
        )
    }
}

/// Result alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let transient = EngineError::TransientBlockServer {
            id: "abc".to_owned(),
            detail: "throttled".to_owned(),
        };
        assert!(transient.is_recoverable_block_error());
        assert!(transient.is_recoverable_for_removal());

        let missing = EngineError::BlockNotFound {
            id: "abc".to_owned(),
        };
        assert!(!missing.is_recoverable_block_error());
        assert!(missing.is_recoverable_for_removal());

        assert!(!EngineError::Cancelled.is_recoverable_block_error());
        assert!(!EngineError::Cancelled.is_recoverable_for_removal());
        let store = EngineError::BlockStore("quota exceeded".to_owned());
        assert!(!store.is_recoverable_block_error());
        assert!(!store.is_recoverable_for_removal());
    }

    #[test]
    fn display_carries_detail() {
        let err = EngineError::DataVersionTooNew {
            found: 9,
            supported: 2,
        };
        assert_eq!(
            err.to_string(),
            "block data version 9 exceeds supported version 2"
        );
    }
}
