use std::sync::Arc;

use cask_crypto::Digest;
use cask_driver::{Driver, Multiplex};
use cask_types::{Bucket, Hash};
use tracing::{debug, trace};

use crate::error::{StorageError, StorageResult};
use crate::root::Root;

/// Content-addressed object access on top of the driver stack.
///
/// `Objects` knows which bucket is active and where relocated copies must go
/// while a collection runs. It is cheap to clone; clones share the driver
/// and the root.
#[derive(Clone)]
pub struct Objects {
    driver: Arc<Multiplex>,
    digest: Arc<dyn Digest>,
    root: Arc<Root>,
}

impl Objects {
    pub(crate) fn new(driver: Arc<Multiplex>, digest: Arc<dyn Digest>, root: Arc<Root>) -> Self {
        Self {
            driver,
            digest,
            root,
        }
    }

    /// The driver stack.
    pub fn driver(&self) -> &Arc<Multiplex> {
        &self.driver
    }

    /// Content hash of `bytes`.
    pub fn hash(&self, bytes: &[u8]) -> Hash {
        self.digest.digest(bytes)
    }

    /// Store `bytes` and return their hash.
    ///
    /// While a collection runs the object is also written into the target
    /// bucket, so it survives the flip even if the collector already walked
    /// past the place that references it.
    pub fn put(&self, bytes: &[u8]) -> StorageResult<Hash> {
        let hash = self.hash(bytes);
        let (active, gc_target) = self.root.write_buckets();
        self.driver.store(&hash, bytes, active)?;
        if let Some(target) = gc_target {
            self.driver.store(&hash, bytes, target)?;
        }
        trace!(key = %hash.short_hex(), len = bytes.len(), %active, "object stored");
        Ok(hash)
    }

    /// Fetch the bytes stored under `hash`, active bucket first.
    ///
    /// Returned bytes are verified against `hash`. A driver error in one
    /// bucket is reported only if the other bucket has no copy either.
    pub fn get(&self, hash: &Hash) -> StorageResult<Option<Vec<u8>>> {
        let active = self.root.active_bucket();
        let mut failure = None;
        for bucket in [active, active.other()] {
            match self.driver.load(hash, bucket) {
                Ok(Some(bytes)) => {
                    if self.hash(&bytes) != *hash {
                        return Err(StorageError::Corrupt {
                            hash: *hash,
                            reason: format!("content does not match its key (bucket {bucket})"),
                        });
                    }
                    return Ok(Some(bytes));
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(key = %hash.short_hex(), %bucket, error = %e, "bucket unreadable");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Ensure every driver holds `hash` in `target`. Returns `true` if a copy
    /// was written.
    pub fn copy_to(&self, hash: &Hash, target: Bucket) -> StorageResult<bool> {
        if self.driver.held_by_all(hash, target)? {
            return Ok(false);
        }
        let bytes = self
            .get(hash)?
            .ok_or_else(|| StorageError::object_not_found("object", hash))?;
        self.driver.store(hash, &bytes, target)?;
        debug!(key = %hash.short_hex(), %target, "object relocated");
        Ok(true)
    }
}

impl std::fmt::Debug for Objects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Objects")
            .field("driver", &self.driver)
            .field("active", &self.root.active_bucket())
            .finish()
    }
}
