use cask_types::{Bucket, Hash};

use crate::error::DriverResult;

/// Hash-keyed backend with two content buckets and a root slot.
///
/// All implementations must satisfy these invariants:
/// - `store` is idempotent. Re-storing the same key is a no-op success;
///   content-addressing guarantees the bytes are identical.
/// - `store_root` overwrites the previous root atomically: a reader sees
///   either the old root or the new one, never a mix.
/// - `load_root` returning `Ok(None)` means the backend was never
///   initialized.
/// - Failures are reported as `Err`, never dropped.
pub trait Driver: Send + Sync {
    /// Short human-readable name used in logs.
    fn name(&self) -> &str;

    /// Write an object into `bucket`.
    fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> DriverResult<()>;

    /// Read an object from `bucket`.
    ///
    /// Returns `Ok(None)` if the key does not exist in that bucket.
    fn load(&self, key: &Hash, bucket: Bucket) -> DriverResult<Option<Vec<u8>>>;

    /// Check whether `bucket` holds `key`.
    ///
    /// Default implementation calls `load()`. Backends may override to
    /// avoid reading the value.
    fn exists(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        Ok(self.load(key, bucket)?.is_some())
    }

    /// Overwrite the root slot.
    fn store_root(&self, value: &[u8]) -> DriverResult<()>;

    /// Read the root slot.
    fn load_root(&self) -> DriverResult<Option<Vec<u8>>>;

    /// Number of distinct objects held in `bucket`.
    fn count(&self, bucket: Bucket) -> DriverResult<usize>;
}
