use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use cask_types::{Bucket, Hash};
use parking_lot::RwLock;

use crate::error::{DriverError, DriverResult};
use crate::traits::Driver;

#[derive(Default)]
struct Buckets {
    a: HashMap<Hash, Vec<u8>>,
    b: HashMap<Hash, Vec<u8>>,
    root: Option<Vec<u8>>,
}

impl Buckets {
    fn bucket(&self, bucket: Bucket) -> &HashMap<Hash, Vec<u8>> {
        match bucket {
            Bucket::A => &self.a,
            Bucket::B => &self.b,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut HashMap<Hash, Vec<u8>> {
        match bucket {
            Bucket::A => &mut self.a,
            Bucket::B => &mut self.b,
        }
    }
}

/// In-memory, HashMap-based driver.
///
/// Intended for tests and embedding. Both buckets and the root slot live
/// behind one `RwLock`; values are cloned on read and write.
///
/// [`MemoryDriver::set_offline`] makes every call fail with
/// [`DriverError::Unavailable`], which is how tests simulate a dead backend.
pub struct MemoryDriver {
    name: String,
    inner: RwLock<Buckets>,
    offline: AtomicBool,
}

impl MemoryDriver {
    /// Create a new empty driver.
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create a new empty driver with a custom log name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Buckets::default()),
            offline: AtomicBool::new(false),
        }
    }

    /// Switch the driver off (`true`) or back on (`false`).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total bytes held in `bucket`.
    pub fn total_bytes(&self, bucket: Bucket) -> u64 {
        self.inner
            .read()
            .bucket(bucket)
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }

    /// Drop every object in `bucket`, as an external compaction would.
    pub fn clear_bucket(&self, bucket: Bucket) {
        self.inner.write().bucket_mut(bucket).clear();
    }

    /// Sorted list of every key in `bucket`.
    pub fn keys(&self, bucket: Bucket) -> Vec<Hash> {
        let inner = self.inner.read();
        let mut keys: Vec<Hash> = inner.bucket(bucket).keys().copied().collect();
        keys.sort();
        keys
    }

    fn check_online(&self) -> DriverResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DriverError::Unavailable {
                driver: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> DriverResult<()> {
        self.check_online()?;
        let mut inner = self.inner.write();
        // Idempotent: content-addressing guarantees the same key always maps
        // to the same bytes.
        inner
            .bucket_mut(bucket)
            .entry(*key)
            .or_insert_with(|| value.to_vec());
        Ok(())
    }

    fn load(&self, key: &Hash, bucket: Bucket) -> DriverResult<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.inner.read().bucket(bucket).get(key).cloned())
    }

    fn exists(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        self.check_online()?;
        Ok(self.inner.read().bucket(bucket).contains_key(key))
    }

    fn store_root(&self, value: &[u8]) -> DriverResult<()> {
        self.check_online()?;
        self.inner.write().root = Some(value.to_vec());
        Ok(())
    }

    fn load_root(&self) -> DriverResult<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.inner.read().root.clone())
    }

    fn count(&self, bucket: Bucket) -> DriverResult<usize> {
        self.check_online()?;
        Ok(self.inner.read().bucket(bucket).len())
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemoryDriver")
            .field("name", &self.name)
            .field("a", &inner.a.len())
            .field("b", &inner.b.len())
            .field("has_root", &inner.root.is_some())
            .finish()
    }
}
