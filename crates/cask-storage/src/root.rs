//! The root pointer: the single mutable name of the current snapshot.
//!
//! The root is not content-addressed. It lives in the driver's control slot
//! and is overwritten on every commit and every GC state change. All of its
//! fields sit behind one lock together with the transient GC target bucket,
//! so readers always see the flip and the target change together. Updates
//! are serialized by a second lock that is held while the driver persists,
//! so readers never wait on backend I/O.

use std::time::Duration;

use cask_driver::Driver;
use cask_types::{Bucket, Hash};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

/// Current on-disk version of [`RootRecord`].
pub const ROOT_VERSION: u32 = 1;

/// Persisted root fields. Read-only outside this module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    version: u32,
    sequence: u64,
    tree_hash: Hash,
    active_bucket: Bucket,
    gc_last_run: i64,
    gc_root_hash: Hash,
    gc_in_progress: bool,
}

impl Default for RootRecord {
    fn default() -> Self {
        Self {
            version: ROOT_VERSION,
            sequence: 0,
            tree_hash: Hash::null(),
            active_bucket: Bucket::A,
            gc_last_run: 0,
            gc_root_hash: Hash::null(),
            gc_in_progress: false,
        }
    }
}

impl RootRecord {
    /// Number of committed mutation cycles.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Hash of the committed tree (null for an empty store).
    pub fn tree_hash(&self) -> Hash {
        self.tree_hash
    }

    /// Bucket that receives writes.
    pub fn active_bucket(&self) -> Bucket {
        self.active_bucket
    }

    /// Unix timestamp (seconds) of the last completed GC, 0 if never.
    pub fn gc_last_run(&self) -> i64 {
        self.gc_last_run
    }

    /// Tree hash relocated by the last completed GC.
    pub fn gc_root_hash(&self) -> Hash {
        self.gc_root_hash
    }

    /// Whether a GC pass is running (or was interrupted by a crash).
    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress
    }

    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let record: Self = serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
            hash: Hash::null(),
            reason: format!("root: {e}"),
        })?;
        if record.version > ROOT_VERSION {
            return Err(StorageError::Corrupt {
                hash: Hash::null(),
                reason: format!("root: unsupported version {}", record.version),
            });
        }
        Ok(record)
    }
}

/// What a GC pass relocates, captured when it starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GcTicket {
    pub tree_hash: Hash,
    pub source: Bucket,
    pub target: Bucket,
}

#[derive(Clone)]
struct RootState {
    record: RootRecord,
    /// Bucket receiving relocated objects while a GC pass runs.
    gc_target: Option<Bucket>,
}

/// Owner of the root record.
pub struct Root {
    state: Mutex<RootState>,
    /// Held across persist-then-publish.
    update: Mutex<()>,
}

impl Root {
    /// Load the root from `driver`, or start an empty one if the backend was
    /// never initialized.
    pub(crate) fn load(driver: &dyn Driver) -> StorageResult<Self> {
        let record = match driver.load_root()? {
            Some(bytes) => RootRecord::from_bytes(&bytes)?,
            None => {
                info!(driver = driver.name(), "no root found; starting empty store");
                RootRecord::default()
            }
        };
        debug!(
            sequence = record.sequence,
            tree = %record.tree_hash.short_hex(),
            bucket = %record.active_bucket,
            "root loaded"
        );
        Ok(Self {
            state: Mutex::new(RootState {
                record,
                gc_target: None,
            }),
            update: Mutex::new(()),
        })
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> RootRecord {
        self.state.lock().record.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().record.sequence
    }

    pub fn tree_hash(&self) -> Hash {
        self.state.lock().record.tree_hash
    }

    pub fn active_bucket(&self) -> Bucket {
        self.state.lock().record.active_bucket
    }

    /// Active bucket plus the GC target, if a pass is running.
    pub(crate) fn write_buckets(&self) -> (Bucket, Option<Bucket>) {
        let state = self.state.lock();
        (state.record.active_bucket, state.gc_target)
    }

    /// Apply `change` to a copy of the record, persist it, and publish it
    /// only if the driver accepted the write.
    fn update(
        &self,
        driver: &dyn Driver,
        change: impl FnOnce(&mut RootState) -> StorageResult<()>,
    ) -> StorageResult<RootRecord> {
        let _update = self.update.lock();
        let mut next = self.state.lock().clone();
        change(&mut next)?;
        driver.store_root(&next.record.to_bytes()?)?;
        let record = next.record.clone();
        *self.state.lock() = next;
        Ok(record)
    }

    /// Name `tree_hash` as the current snapshot. Returns the new sequence.
    pub(crate) fn commit(&self, driver: &dyn Driver, tree_hash: Hash) -> StorageResult<u64> {
        let record = self.update(driver, |next| {
            next.record.sequence += 1;
            next.record.tree_hash = tree_hash;
            Ok(())
        })?;
        Ok(record.sequence)
    }

    /// Whether the interval since the last GC has elapsed.
    pub(crate) fn gc_due(&self, now: i64, interval: Duration) -> bool {
        let state = self.state.lock();
        !state.record.gc_in_progress
            && now.saturating_sub(state.record.gc_last_run)
                >= i64::try_from(interval.as_secs()).unwrap_or(i64::MAX)
    }

    /// Mark a GC pass as started and capture what it must relocate.
    ///
    /// Fails with [`StorageError::GcInProgress`] if one is already running.
    pub(crate) fn begin_gc(&self, driver: &dyn Driver) -> StorageResult<GcTicket> {
        let record = self.update(driver, |next| {
            if next.record.gc_in_progress {
                return Err(StorageError::GcInProgress);
            }
            next.record.gc_in_progress = true;
            next.gc_target = Some(next.record.active_bucket.other());
            Ok(())
        })?;
        Ok(GcTicket {
            tree_hash: record.tree_hash,
            source: record.active_bucket,
            target: record.active_bucket.other(),
        })
    }

    /// Flip the active bucket after a complete relocation.
    pub(crate) fn finish_gc(
        &self,
        driver: &dyn Driver,
        ticket: &GcTicket,
        now: i64,
    ) -> StorageResult<()> {
        self.update(driver, |next| {
            next.record.active_bucket = ticket.target;
            next.record.gc_root_hash = ticket.tree_hash;
            next.record.gc_last_run = now;
            next.record.gc_in_progress = false;
            next.gc_target = None;
            Ok(())
        })?;
        Ok(())
    }

    /// Clear the in-progress flag without flipping.
    ///
    /// The in-memory state is released even if persisting fails, so a
    /// failed pass never blocks later ones. A flag left on disk is
    /// overwritten by the next root write, or resumed at the next open.
    pub(crate) fn abort_gc(&self, driver: &dyn Driver) -> StorageResult<()> {
        let _update = self.update.lock();
        let record = {
            let mut state = self.state.lock();
            state.record.gc_in_progress = false;
            state.gc_target = None;
            state.record.clone()
        };
        driver.store_root(&record.to_bytes()?)?;
        Ok(())
    }

    /// Clear a GC flag left behind by a crash. Returns `true` if there was one.
    pub(crate) fn clear_interrupted_gc(&self, driver: &dyn Driver) -> StorageResult<bool> {
        if !self.state.lock().record.gc_in_progress {
            return Ok(false);
        }
        warn!("previous garbage collection was interrupted; it will be resumed");
        self.abort_gc(driver)?;
        Ok(true)
    }
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Root")
            .field("record", &state.record)
            .field("gc_target", &state.gc_target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_driver::MemoryDriver;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn hash(byte: u8) -> Hash {
        Hash::from_digest([byte; 32])
    }

    #[test]
    fn empty_driver_yields_default_root() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        let record = root.snapshot();
        assert_eq!(record.sequence(), 0);
        assert!(record.tree_hash().is_null());
        assert_eq!(record.active_bucket(), Bucket::A);
        assert!(!record.gc_in_progress());
    }

    #[test]
    fn commit_bumps_sequence_and_persists() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        assert_eq!(root.commit(&driver, hash(1)).unwrap(), 1);
        assert_eq!(root.commit(&driver, hash(2)).unwrap(), 2);

        let reloaded = Root::load(&driver).unwrap();
        assert_eq!(reloaded.sequence(), 2);
        assert_eq!(reloaded.tree_hash(), hash(2));
    }

    #[test]
    fn failed_commit_leaves_root_untouched() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        root.commit(&driver, hash(1)).unwrap();

        driver.set_offline(true);
        assert!(root.commit(&driver, hash(2)).is_err());
        assert_eq!(root.sequence(), 1);
        assert_eq!(root.tree_hash(), hash(1));
    }

    #[test]
    fn gc_lifecycle_flips_bucket() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        root.commit(&driver, hash(1)).unwrap();

        let ticket = root.begin_gc(&driver).unwrap();
        assert_eq!(ticket.source, Bucket::A);
        assert_eq!(ticket.target, Bucket::B);
        assert_eq!(ticket.tree_hash, hash(1));
        assert_eq!(root.write_buckets(), (Bucket::A, Some(Bucket::B)));
        assert!(root.snapshot().gc_in_progress());

        root.finish_gc(&driver, &ticket, 1_000).unwrap();
        let record = root.snapshot();
        assert_eq!(record.active_bucket(), Bucket::B);
        assert_eq!(record.gc_root_hash(), hash(1));
        assert_eq!(record.gc_last_run(), 1_000);
        assert!(!record.gc_in_progress());
        assert_eq!(root.write_buckets(), (Bucket::B, None));
        // GC bookkeeping does not count as a mutation cycle.
        assert_eq!(record.sequence(), 1);
    }

    #[test]
    fn second_gc_is_refused() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        root.begin_gc(&driver).unwrap();
        assert!(matches!(
            root.begin_gc(&driver),
            Err(StorageError::GcInProgress)
        ));
    }

    #[test]
    fn abort_keeps_bucket() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        root.begin_gc(&driver).unwrap();
        root.abort_gc(&driver).unwrap();
        let record = root.snapshot();
        assert_eq!(record.active_bucket(), Bucket::A);
        assert!(!record.gc_in_progress());
        assert_eq!(root.write_buckets(), (Bucket::A, None));
    }

    #[test]
    fn abort_releases_gc_even_if_persist_fails() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        let ticket = root.begin_gc(&driver).unwrap();

        driver.set_offline(true);
        assert!(root.finish_gc(&driver, &ticket, 1_000).is_err());
        assert!(root.abort_gc(&driver).is_err());
        assert!(!root.snapshot().gc_in_progress());
        assert_eq!(root.write_buckets(), (Bucket::A, None));

        driver.set_offline(false);
        let ticket = root.begin_gc(&driver).unwrap();
        root.finish_gc(&driver, &ticket, 2_000).unwrap();
        assert_eq!(root.active_bucket(), Bucket::B);
    }

    #[test]
    fn huge_interval_is_never_due() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        assert!(!root.gc_due(1_700_000_000, Duration::from_secs(u64::MAX)));
    }

    /// Memory driver whose root writes wait for the test to release them.
    struct GatedRoot {
        inner: MemoryDriver,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Driver for GatedRoot {
        fn name(&self) -> &str {
            "gated"
        }

        fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> cask_driver::DriverResult<()> {
            self.inner.store(key, value, bucket)
        }

        fn load(&self, key: &Hash, bucket: Bucket) -> cask_driver::DriverResult<Option<Vec<u8>>> {
            self.inner.load(key, bucket)
        }

        fn store_root(&self, value: &[u8]) -> cask_driver::DriverResult<()> {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
            self.inner.store_root(value)
        }

        fn load_root(&self) -> cask_driver::DriverResult<Option<Vec<u8>>> {
            self.inner.load_root()
        }

        fn count(&self, bucket: Bucket) -> cask_driver::DriverResult<usize> {
            self.inner.count(bucket)
        }
    }

    #[test]
    fn readers_do_not_wait_for_root_persistence() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let driver = GatedRoot {
            inner: MemoryDriver::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let root = Root::load(&driver).unwrap();

        thread::scope(|s| {
            let writer = s.spawn(|| root.commit(&driver, hash(1)));
            entered_rx.recv().unwrap();
            // The write is in flight: readers see the previous record.
            let started = Instant::now();
            assert_eq!(root.sequence(), 0);
            assert_eq!(root.active_bucket(), Bucket::A);
            assert!(started.elapsed() < Duration::from_secs(1));
            release_tx.send(()).unwrap();
            assert_eq!(writer.join().unwrap().unwrap(), 1);
        });
        assert_eq!(root.sequence(), 1);
    }

    #[test]
    fn interrupted_gc_is_detected_on_reload() {
        let driver = MemoryDriver::new();
        {
            let root = Root::load(&driver).unwrap();
            root.begin_gc(&driver).unwrap();
            // Dropped without finish: simulates a crash mid-collection.
        }
        let root = Root::load(&driver).unwrap();
        assert!(root.snapshot().gc_in_progress());
        assert!(root.clear_interrupted_gc(&driver).unwrap());
        assert!(!root.clear_interrupted_gc(&driver).unwrap());
    }

    #[test]
    fn gc_due_respects_interval() {
        let driver = MemoryDriver::new();
        let root = Root::load(&driver).unwrap();
        let hour = Duration::from_secs(3600);
        assert!(root.gc_due(3600, hour));
        let ticket = root.begin_gc(&driver).unwrap();
        assert!(!root.gc_due(10_000, hour));
        root.finish_gc(&driver, &ticket, 5_000).unwrap();
        assert!(!root.gc_due(5_000 + 3599, hour));
        assert!(root.gc_due(5_000 + 3600, hour));
    }

    #[test]
    fn garbage_root_is_corrupt() {
        let driver = MemoryDriver::new();
        driver.store_root(b"not json").unwrap();
        assert!(matches!(
            Root::load(&driver),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
