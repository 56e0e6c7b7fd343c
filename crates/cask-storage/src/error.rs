use cask_driver::DriverError;
use cask_types::Hash;
use thiserror::Error;

use crate::index::LeafKind;

/// Errors from storage engine operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A logical id or object was not found by a non-checking load.
    #[error("{kind} entry not found: {id}")]
    NotFound { kind: String, id: String },

    /// Bytes exist but do not parse into the expected shape.
    #[error("corrupt object {hash}: {reason}")]
    Corrupt { hash: Hash, reason: String },

    /// The backend failed; nothing was committed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A garbage collection pass was cancelled by shutdown.
    #[error("garbage collection aborted")]
    GcAborted,

    /// Another garbage collection pass is already running.
    #[error("garbage collection already in progress")]
    GcInProgress,

    /// Serialization failure while encoding a node.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend changeover failed; the previous backend stays authoritative.
    #[error("migration failed: {0}")]
    Migration(String),

    /// I/O error outside of a driver (config and marker files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn entry_not_found(kind: LeafKind, id: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn object_not_found(what: &str, hash: &Hash) -> Self {
        Self::NotFound {
            kind: what.to_string(),
            id: hash.to_hex(),
        }
    }

    /// Returns `true` for errors a checking load turns into "absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
