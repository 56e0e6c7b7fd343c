use std::sync::Arc;

use cask_crypto::{open, seal, BackupKey, Random};
use cask_types::{Bucket, Hash};

use crate::error::DriverResult;
use crate::traits::Driver;

const ROOT_AAD: &[u8] = b"cask-root";

/// Driver wrapper that seals every value with AES-256-GCM.
///
/// Keys stay plaintext hashes so that existence checks and counts still
/// work; values (objects and the root) are ciphertext at rest. Each object
/// is sealed with its key as associated data.
pub struct EncryptedDriver {
    inner: Arc<dyn Driver>,
    key: BackupKey,
    random: Arc<dyn Random>,
    name: String,
}

impl EncryptedDriver {
    /// Wrap `inner` with the given key and nonce source.
    pub fn new(inner: Arc<dyn Driver>, key: BackupKey, random: Arc<dyn Random>) -> Self {
        let name = format!("encrypted({})", inner.name());
        Self {
            inner,
            key,
            random,
            name,
        }
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &Arc<dyn Driver> {
        &self.inner
    }
}

impl Driver for EncryptedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> DriverResult<()> {
        // Sealing is randomized; skip it when the key is already present so
        // the inner driver's idempotency holds.
        if self.inner.exists(key, bucket)? {
            return Ok(());
        }
        let sealed = seal(&self.key, self.random.as_ref(), value, key.as_bytes())?;
        self.inner.store(key, &sealed, bucket)
    }

    fn load(&self, key: &Hash, bucket: Bucket) -> DriverResult<Option<Vec<u8>>> {
        match self.inner.load(key, bucket)? {
            Some(sealed) => Ok(Some(open(&self.key, &sealed, key.as_bytes())?)),
            None => Ok(None),
        }
    }

    fn exists(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        self.inner.exists(key, bucket)
    }

    fn store_root(&self, value: &[u8]) -> DriverResult<()> {
        let sealed = seal(&self.key, self.random.as_ref(), value, ROOT_AAD)?;
        self.inner.store_root(&sealed)
    }

    fn load_root(&self) -> DriverResult<Option<Vec<u8>>> {
        match self.inner.load_root()? {
            Some(sealed) => Ok(Some(open(&self.key, &sealed, ROOT_AAD)?)),
            None => Ok(None),
        }
    }

    fn count(&self, bucket: Bucket) -> DriverResult<usize> {
        self.inner.count(bucket)
    }
}

impl std::fmt::Debug for EncryptedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedDriver")
            .field("inner", &self.inner.name())
            .finish()
    }
}
