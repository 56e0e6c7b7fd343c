use cask_types::Hash;

/// Errors from driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// I/O error from a file-backed driver.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the embedded SQL engine.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Sealing or opening an encrypted payload failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] cask_crypto::CipherError),

    /// Stored bytes failed an integrity check.
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The driver is switched off or disconnected.
    #[error("driver {driver} is unavailable")]
    Unavailable { driver: String },

    /// A migration could not be completed.
    #[error("migration failed: {0}")]
    Migration(String),
}

impl DriverError {
    pub(crate) fn corrupt(key: &Hash, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_hex(),
            reason: reason.into(),
        }
    }
}

/// Result alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;
