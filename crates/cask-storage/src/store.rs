use std::fs;
use std::sync::Arc;

use cask_crypto::{BackupKey, ContentHasher, Digest, OsRandom, Random};
use cask_driver::{Driver, EncryptedDriver, MigrationReport, Multiplex};
use cask_types::{Bucket, Hash};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{BackendKind, BackendMarker, GcConfig, StoreConfig};
use crate::editor::Editor;
use crate::error::{StorageError, StorageResult};
use crate::gc::{self, GcControl, GcReport, GcWorker};
use crate::index::{Index, LeafKind};
use crate::locks::LockTable;
use crate::node::Node;
use crate::objects::Objects;
use crate::root::{Root, RootRecord};
use crate::tree::Tree;

/// Primitives the store consumes instead of reaching for globals.
#[derive(Clone)]
pub struct Capabilities {
    pub digest: Arc<dyn Digest>,
    pub random: Arc<dyn Random>,
    /// Required by backups configured with `encrypt = true`.
    pub backup_key: Option<BackupKey>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            digest: Arc::new(ContentHasher::OBJECT),
            random: Arc::new(OsRandom),
            backup_key: None,
        }
    }
}

impl Capabilities {
    /// Derive the backup key from a store-wide secret.
    pub fn with_backup_secret(mut self, secret: &[u8]) -> Self {
        self.backup_key = Some(BackupKey::derive(secret));
        self
    }
}

/// Options for [`Store::with_drivers`].
#[derive(Clone)]
pub struct StoreOptions {
    pub gc: GcConfig,
    pub digest: Arc<dyn Digest>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            digest: Arc::new(ContentHasher::OBJECT),
        }
    }
}

impl StoreOptions {
    /// Defaults with the background worker switched off.
    pub fn without_gc() -> Self {
        Self {
            gc: GcConfig::disabled(),
            ..Self::default()
        }
    }
}

/// State shared between the facade and the GC worker.
pub(crate) struct StoreInner {
    pub(crate) driver: Arc<Multiplex>,
    pub(crate) objects: Objects,
    pub(crate) root: Arc<Root>,
    /// Serializes top-level writers and GC start.
    pub(crate) write_lock: Mutex<()>,
    current: RwLock<Arc<Tree>>,
    pub(crate) gc: GcControl,
    locks: LockTable,
    pub(crate) options: StoreOptions,
}

/// The persistence engine's public face.
///
/// Writers go through [`Store::mutable_tree`], which blocks until the single
/// write lock is free. Readers never take that lock: they work on the tree
/// snapshot that was current when they asked for it.
pub struct Store {
    inner: Arc<StoreInner>,
    worker: Mutex<Option<GcWorker>>,
    startup_migration: Option<MigrationReport>,
}

impl Store {
    /// Open the store described by `config`.
    ///
    /// Switching `config.primary` to a different backend migrates the live
    /// snapshot from the previously recorded backend first. If that fails
    /// the store does not open and the old backend stays untouched. Backups
    /// are set up before any migration, so a misconfigured backup leaves the
    /// recorded backend as it was.
    pub fn open(config: &StoreConfig, caps: Capabilities) -> StorageResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let mut secondaries = Vec::with_capacity(config.backups.len());
        for backup in &config.backups {
            let driver = backup.kind.open(&config.backup_location(backup))?;
            let driver: Arc<dyn Driver> = if backup.encrypt {
                let key = caps.backup_key.clone().ok_or_else(|| {
                    StorageError::Config(format!(
                        "backup {} is encrypted but no backup secret was supplied",
                        driver.name()
                    ))
                })?;
                Arc::new(EncryptedDriver::new(driver, key, Arc::clone(&caps.random)))
            } else {
                driver
            };
            secondaries.push(driver);
        }

        let primary = config.primary.open(&config.primary_location())?;

        let mut startup_migration = None;
        if config.primary.is_persistent() {
            match BackendMarker::read(&config.data_dir)? {
                Some(previous) if previous != config.primary => {
                    info!(from = %previous, to = %config.primary, "primary backend changed; migrating");
                    let source = previous.open(&previous.default_location(&config.data_dir))?;
                    startup_migration =
                        migrate_backend(source, Arc::clone(&primary), Arc::clone(&caps.digest))?;
                    BackendMarker::write(&config.data_dir, config.primary)?;
                }
                Some(_) => {}
                None => BackendMarker::write(&config.data_dir, config.primary)?,
            }
        }

        let options = StoreOptions {
            gc: config.gc.clone(),
            digest: caps.digest,
        };
        let mut store = Self::with_drivers(primary, secondaries, options)?;
        store.startup_migration = startup_migration;
        Ok(store)
    }

    /// Build a store over explicit drivers.
    pub fn with_drivers(
        primary: Arc<dyn Driver>,
        secondaries: Vec<Arc<dyn Driver>>,
        options: StoreOptions,
    ) -> StorageResult<Self> {
        let driver = Arc::new(Multiplex::with_secondaries(primary, secondaries));
        let root = Arc::new(Root::load(driver.as_ref())?);
        let objects = Objects::new(
            Arc::clone(&driver),
            Arc::clone(&options.digest),
            Arc::clone(&root),
        );
        let tree = Tree::load(&objects, &root.tree_hash())?;
        let resume_gc = root.clear_interrupted_gc(driver.as_ref())?;

        let inner = Arc::new(StoreInner {
            driver,
            objects,
            root,
            write_lock: Mutex::new(()),
            current: RwLock::new(Arc::new(tree)),
            gc: GcControl::default(),
            locks: LockTable::new(),
            options,
        });

        if resume_gc {
            if inner.options.gc.enabled {
                inner.gc.request();
            } else {
                match gc::collect(&inner) {
                    Ok(report) => info!(copied = report.copied, "interrupted garbage collection resumed"),
                    Err(e) => warn!(error = %e, "resuming garbage collection failed"),
                }
            }
        }

        let worker = if inner.options.gc.enabled {
            Some(GcWorker::spawn(Arc::clone(&inner))?)
        } else {
            None
        };

        let record = inner.root.snapshot();
        let primary = inner.driver.primary();
        info!(
            sequence = record.sequence(),
            tree = %record.tree_hash().short_hex(),
            bucket = %record.active_bucket(),
            primary = primary.name(),
            backups = inner.driver.secondaries().len(),
            "store opened"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
            startup_migration: None,
        })
    }

    /// Exclusive write access to a copy of the latest committed tree.
    ///
    /// Blocks while another writer holds the tree. Committing (or dropping)
    /// the editor saves the tree, persists a new root and publishes the new
    /// snapshot to readers; aborting releases the lock with nothing written.
    pub fn mutable_tree(&self) -> Editor<'_, Tree> {
        let guard = self.inner.write_lock.lock();
        let tree = Tree::clone(&self.inner.current.read());
        let inner = &*self.inner;
        Editor::new(
            tree,
            inner.objects.clone(),
            Box::new(move |mut tree: Tree, objects: &Objects| {
                let _guard = guard;
                let hash = tree.save(objects)?;
                let sequence = inner.root.commit(inner.driver.as_ref(), hash)?;
                *inner.current.write() = Arc::new(tree);
                info!(sequence, tree = %hash.short_hex(), "snapshot committed");
                Ok(hash)
            }),
        )
    }

    /// The committed tree at this instant.
    pub fn tree(&self) -> Arc<Tree> {
        Arc::clone(&self.inner.current.read())
    }

    /// The root record at this instant.
    pub fn root(&self) -> RootRecord {
        self.inner.root.snapshot()
    }

    /// Read-only view of one leaf in the current snapshot.
    pub fn index(&self, kind: LeafKind) -> StorageResult<Arc<Index>> {
        self.tree().index(&self.inner.objects, kind)
    }

    /// Load the record behind `id`. See [`Index::load`].
    pub fn load(&self, kind: LeafKind, id: &str, checking: bool) -> StorageResult<Option<Vec<u8>>> {
        self.index(kind)?.load(&self.inner.objects, id, checking)
    }

    pub fn alias(&self, kind: LeafKind, id: &str) -> StorageResult<Option<String>> {
        Ok(self.index(kind)?.alias(id).map(str::to_string))
    }

    pub fn exists(&self, kind: LeafKind, id: &str) -> StorageResult<bool> {
        Ok(self.index(kind)?.exists(id))
    }

    pub fn hash(&self, kind: LeafKind, id: &str) -> StorageResult<Option<Hash>> {
        Ok(self.index(kind)?.hash(id))
    }

    pub fn revision(&self, kind: LeafKind, id: &str) -> StorageResult<Option<u64>> {
        Ok(self.index(kind)?.revision(id))
    }

    /// `(id, alias)` pairs of the `kind` leaf.
    pub fn list(&self, kind: LeafKind) -> StorageResult<Vec<(String, String)>> {
        Ok(self.index(kind)?.list())
    }

    pub fn len(&self, kind: LeafKind) -> StorageResult<usize> {
        Ok(self.index(kind)?.len())
    }

    /// Content-addressed object access.
    pub fn objects(&self) -> &Objects {
        &self.inner.objects
    }

    /// The driver stack.
    pub fn driver(&self) -> &Arc<Multiplex> {
        &self.inner.driver
    }

    /// Objects the primary holds in `bucket`.
    pub fn object_count(&self, bucket: Bucket) -> StorageResult<usize> {
        Ok(self.inner.driver.count(bucket)?)
    }

    /// Report of the backend changeover performed by [`Store::open`].
    pub fn startup_migration(&self) -> Option<&MigrationReport> {
        self.startup_migration.as_ref()
    }

    /// Run a collection on the calling thread.
    pub fn collect_garbage(&self) -> StorageResult<GcReport> {
        gc::collect(&self.inner)
    }

    /// Wake the background worker for a pass. No-op without a worker.
    pub fn request_gc(&self) {
        self.inner.gc.request();
    }

    /// Copy the live snapshot into `target` and make it the primary.
    ///
    /// Holds the write lock for the whole copy. Refused while a collection
    /// runs.
    pub fn migrate(&self, target: Arc<dyn Driver>) -> StorageResult<MigrationReport> {
        let _writer = self.inner.write_lock.lock();
        let record = self.inner.root.snapshot();
        if record.gc_in_progress() {
            return Err(StorageError::GcInProgress);
        }
        let live = gc::live_set(&self.inner.objects, &record.tree_hash())?;
        self.inner
            .driver
            .migrate(target, &live, record.active_bucket())
            .map_err(|e| StorageError::Migration(e.to_string()))
    }

    /// Lock guarding one logical entity.
    pub fn entity_lock(&self, kind: LeafKind, id: &str) -> Arc<Mutex<()>> {
        self.inner.locks.get(kind, id)
    }

    /// Stop the GC worker, cancelling a running pass. Idempotent.
    pub fn shutdown(&self) {
        self.inner.gc.shutdown();
        if let Some(worker) = self.worker.lock().take() {
            worker.join();
            info!("store shut down");
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("driver", &self.inner.driver)
            .field("root", &self.inner.root.snapshot())
            .finish()
    }
}

/// Move the live snapshot of `source` into `target`.
///
/// Returns `None` when the source was never initialized.
fn migrate_backend(
    source: Arc<dyn Driver>,
    target: Arc<dyn Driver>,
    digest: Arc<dyn Digest>,
) -> StorageResult<Option<MigrationReport>> {
    if source.load_root()?.is_none() {
        info!(source = source.name(), "previous backend is empty; nothing to migrate");
        return Ok(None);
    }
    let mux = Arc::new(Multiplex::new(source));
    let root = Arc::new(Root::load(mux.as_ref())?);
    let objects = Objects::new(Arc::clone(&mux), digest, Arc::clone(&root));
    let record = root.snapshot();
    let live = gc::live_set(&objects, &record.tree_hash())?;
    let report = mux
        .migrate(target, &live, record.active_bucket())
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    Ok(Some(report))
}

/// Backend kind recorded for `config`, if the data directory has one.
pub fn recorded_backend(config: &StoreConfig) -> StorageResult<Option<BackendKind>> {
    BackendMarker::read(&config.data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_driver::{MemoryDriver, SqliteDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn memory_store() -> (Arc<MemoryDriver>, Store) {
        let memory = Arc::new(MemoryDriver::new());
        let store = Store::with_drivers(
            Arc::clone(&memory) as Arc<dyn Driver>,
            Vec::new(),
            StoreOptions::without_gc(),
        )
        .unwrap();
        (memory, store)
    }

    fn put(store: &Store, kind: LeafKind, id: &str, record: &[u8]) -> Hash {
        let mut tree = store.mutable_tree();
        tree.leaf(kind).unwrap().store(id, record, None).unwrap();
        tree.commit().unwrap()
    }

    #[test]
    fn fresh_store_is_empty() {
        let (_memory, store) = memory_store();
        let root = store.root();
        assert_eq!(root.sequence(), 0);
        assert!(root.tree_hash().is_null());
        for kind in LeafKind::ALL {
            assert!(store.list(kind).unwrap().is_empty());
        }
        assert!(store.load(LeafKind::Credentials, "x", true).unwrap().is_none());
    }

    #[test]
    fn overwrite_keeps_old_object_until_collected() {
        let (memory, store) = memory_store();
        put(&store, LeafKind::Credentials, "X", b"R1");
        assert_eq!(store.load(LeafKind::Credentials, "X", false).unwrap().unwrap(), b"R1");
        let h1 = store.hash(LeafKind::Credentials, "X").unwrap().unwrap();

        put(&store, LeafKind::Credentials, "X", b"R2");
        let h2 = store.hash(LeafKind::Credentials, "X").unwrap().unwrap();
        assert_ne!(h1, h2);
        assert_eq!(store.load(LeafKind::Credentials, "X", false).unwrap().unwrap(), b"R2");
        assert_eq!(store.objects().get(&h1).unwrap().unwrap(), b"R1");

        let report = store.collect_garbage().unwrap();
        memory.clear_bucket(report.from);
        assert!(store.objects().get(&h1).unwrap().is_none());
        assert_eq!(store.load(LeafKind::Credentials, "X", false).unwrap().unwrap(), b"R2");
    }

    #[test]
    fn sequence_counts_successful_commits_only() {
        let (memory, store) = memory_store();
        for i in 0..5 {
            put(&store, LeafKind::Units, &format!("u{i}"), format!("unit {i}").as_bytes());
        }
        assert_eq!(store.root().sequence(), 5);
        let committed = store.root().tree_hash();

        memory.set_offline(true);
        let mut tree = store.mutable_tree();
        let stored = tree.units().unwrap().store("u9", b"lost", None);
        assert!(stored.is_err());
        assert!(tree.commit().is_err());
        memory.set_offline(false);

        assert_eq!(store.root().sequence(), 5);
        assert_eq!(store.root().tree_hash(), committed);
        assert!(!store.exists(LeafKind::Units, "u9").unwrap());
        // The lock was released by the failed commit.
        put(&store, LeafKind::Units, "u9", b"ok");
        assert_eq!(store.root().sequence(), 6);
    }

    #[test]
    fn aborted_edit_commits_nothing() {
        let (_memory, store) = memory_store();
        let mut tree = store.mutable_tree();
        tree.seeds().unwrap().store("s", b"seed", None).unwrap();
        tree.abort();
        assert_eq!(store.root().sequence(), 0);
        assert!(!store.exists(LeafKind::Seeds, "s").unwrap());
    }

    #[test]
    fn dropped_editor_commits() {
        let (_memory, store) = memory_store();
        {
            let mut tree = store.mutable_tree();
            tree.contacts().unwrap().store("alice", b"card", Some("Alice")).unwrap();
        }
        assert_eq!(store.root().sequence(), 1);
        assert_eq!(store.alias(LeafKind::Contacts, "alice").unwrap().as_deref(), Some("Alice"));
    }

    #[test]
    fn concurrent_writers_lose_no_update() {
        let (_memory, store) = memory_store();
        thread::scope(|s| {
            for id in ["left", "right"] {
                let store = &store;
                s.spawn(move || {
                    let mut tree = store.mutable_tree();
                    tree.credentials()
                        .unwrap()
                        .store(id, id.as_bytes(), None)
                        .unwrap();
                    tree.commit().unwrap();
                });
            }
        });
        assert_eq!(store.root().sequence(), 2);
        assert!(store.exists(LeafKind::Credentials, "left").unwrap());
        assert!(store.exists(LeafKind::Credentials, "right").unwrap());
    }

    #[test]
    fn reads_fall_back_to_backup() {
        let primary = Arc::new(MemoryDriver::named("primary"));
        let backup = Arc::new(MemoryDriver::named("backup"));
        {
            let store = Store::with_drivers(
                Arc::clone(&primary) as Arc<dyn Driver>,
                vec![Arc::clone(&backup) as Arc<dyn Driver>],
                StoreOptions::without_gc(),
            )
            .unwrap();
            put(&store, LeafKind::Issuers, "acme", b"issuer record");

            primary.set_offline(true);
            assert_eq!(
                store.load(LeafKind::Issuers, "acme", false).unwrap().unwrap(),
                b"issuer record"
            );
        }

        // A fresh store can be opened while the primary is still down.
        let store = Store::with_drivers(
            Arc::clone(&primary) as Arc<dyn Driver>,
            vec![Arc::clone(&backup) as Arc<dyn Driver>],
            StoreOptions::without_gc(),
        )
        .unwrap();
        assert_eq!(
            store.load(LeafKind::Issuers, "acme", false).unwrap().unwrap(),
            b"issuer record"
        );
    }

    #[test]
    fn dead_backup_does_not_break_reads_after_flip() {
        let primary = Arc::new(MemoryDriver::named("primary"));
        let backup = Arc::new(MemoryDriver::named("backup"));
        let store = Store::with_drivers(
            Arc::clone(&primary) as Arc<dyn Driver>,
            vec![Arc::clone(&backup) as Arc<dyn Driver>],
            StoreOptions::without_gc(),
        )
        .unwrap();
        put(&store, LeafKind::Contexts, "ctx", b"first");
        let before = store.tree();
        put(&store, LeafKind::Contexts, "ctx", b"second");
        let report = store.collect_garbage().unwrap();
        assert_eq!(report.to, Bucket::B);

        backup.set_offline(true);
        let objects = store.objects();
        let old = before.index(objects, LeafKind::Contexts).unwrap();
        assert_eq!(old.load(objects, "ctx", false).unwrap().unwrap(), b"first");
        assert_eq!(store.load(LeafKind::Contexts, "ctx", false).unwrap().unwrap(), b"second");
        assert!(store.load(LeafKind::Contexts, "missing", true).unwrap().is_none());
    }

    #[test]
    fn fresh_store_opens_with_backup_down() {
        let backup = Arc::new(MemoryDriver::named("backup"));
        backup.set_offline(true);
        let store = Store::with_drivers(
            Arc::new(MemoryDriver::named("primary")),
            vec![Arc::clone(&backup) as Arc<dyn Driver>],
            StoreOptions::without_gc(),
        )
        .unwrap();
        assert_eq!(store.root().sequence(), 0);
        put(&store, LeafKind::Units, "u", b"unit");
        assert_eq!(store.load(LeafKind::Units, "u", false).unwrap().unwrap(), b"unit");
    }

    #[test]
    fn late_backup_is_filled_by_collection() {
        let primary = Arc::new(MemoryDriver::named("primary"));
        {
            let store = Store::with_drivers(
                Arc::clone(&primary) as Arc<dyn Driver>,
                Vec::new(),
                StoreOptions::without_gc(),
            )
            .unwrap();
            put(&store, LeafKind::Issuers, "acme", b"issuer record");
        }

        let backup = Arc::new(MemoryDriver::named("backup"));
        let store = Store::with_drivers(
            Arc::clone(&primary) as Arc<dyn Driver>,
            vec![Arc::clone(&backup) as Arc<dyn Driver>],
            StoreOptions::without_gc(),
        )
        .unwrap();
        let live = gc::live_set(store.objects(), &store.root().tree_hash()).unwrap();
        store.collect_garbage().unwrap();
        let again = store.collect_garbage().unwrap();
        assert_eq!(again.to, Bucket::A);
        assert_eq!(backup.count(Bucket::A).unwrap(), live.len());
        assert_eq!(backup.count(Bucket::B).unwrap(), live.len());

        primary.set_offline(true);
        assert_eq!(
            store.load(LeafKind::Issuers, "acme", false).unwrap().unwrap(),
            b"issuer record"
        );
    }

    /// Memory driver whose `fail_at`-th root write (1-based) fails.
    struct FailingRootWrite {
        inner: MemoryDriver,
        writes: AtomicUsize,
        fail_at: usize,
    }

    impl Driver for FailingRootWrite {
        fn name(&self) -> &str {
            "failing-root"
        }

        fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> cask_driver::DriverResult<()> {
            self.inner.store(key, value, bucket)
        }

        fn load(&self, key: &Hash, bucket: Bucket) -> cask_driver::DriverResult<Option<Vec<u8>>> {
            self.inner.load(key, bucket)
        }

        fn store_root(&self, value: &[u8]) -> cask_driver::DriverResult<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                return Err(cask_driver::DriverError::Unavailable {
                    driver: self.name().to_string(),
                });
            }
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
    fn failed_flip_does_not_block_later_collections() {
        // Root writes: commit, begin, finish (fails), abort.
        let driver = Arc::new(FailingRootWrite {
            inner: MemoryDriver::new(),
            writes: AtomicUsize::new(0),
            fail_at: 3,
        });
        let store = Store::with_drivers(driver, Vec::new(), StoreOptions::without_gc()).unwrap();
        put(&store, LeafKind::Accounts, "a", b"account");

        assert!(matches!(store.collect_garbage(), Err(StorageError::Driver(_))));
        let root = store.root();
        assert!(!root.gc_in_progress());
        assert_eq!(root.active_bucket(), Bucket::A);
        assert_eq!(store.inner.root.write_buckets(), (Bucket::A, None));

        let report = store.collect_garbage().unwrap();
        assert_eq!(report.to, Bucket::B);
        assert_eq!(store.load(LeafKind::Accounts, "a", false).unwrap().unwrap(), b"account");
    }

    #[test]
    fn write_racing_gc_start_is_collected() {
        let (memory, store) = memory_store();
        put(&store, LeafKind::Threads, "t0", b"before");

        let report = thread::scope(|s| {
            let mut tree = store.mutable_tree();
            tree.threads().unwrap().store("t1", b"during", None).unwrap();
            let gc = s.spawn(|| store.collect_garbage());
            thread::sleep(Duration::from_millis(20));
            tree.commit().unwrap();
            gc.join().unwrap().unwrap()
        });

        memory.clear_bucket(report.from);
        assert_eq!(store.load(LeafKind::Threads, "t1", false).unwrap().unwrap(), b"during");
        assert_eq!(store.load(LeafKind::Threads, "t0", false).unwrap().unwrap(), b"before");
        assert_eq!(store.root().gc_root_hash(), store.root().tree_hash());
    }

    #[test]
    fn write_during_relocation_survives_flip() {
        let (memory, store) = memory_store();
        put(&store, LeafKind::Accounts, "a0", b"old account");
        let inner = &store.inner;

        // A pass that captured the tree before the write below.
        let ticket = inner.root.begin_gc(inner.driver.as_ref()).unwrap();
        put(&store, LeafKind::Accounts, "a1", b"new account");
        gc::relocate(&inner.objects, &ticket.tree_hash, ticket.target, &inner.gc).unwrap();
        inner.root.finish_gc(inner.driver.as_ref(), &ticket, gc::now()).unwrap();

        memory.clear_bucket(ticket.source);
        assert_eq!(store.load(LeafKind::Accounts, "a1", false).unwrap().unwrap(), b"new account");
        assert_eq!(store.load(LeafKind::Accounts, "a0", false).unwrap().unwrap(), b"old account");
        assert_ne!(store.root().gc_root_hash(), store.root().tree_hash());

        // The next pass picks up the post-write tree.
        store.collect_garbage().unwrap();
        assert_eq!(store.root().gc_root_hash(), store.root().tree_hash());
    }

    #[test]
    fn gc_preserves_everything_reachable() {
        let (memory, store) = memory_store();
        {
            let mut tree = store.mutable_tree();
            for kind in LeafKind::ALL {
                let mut leaf = tree.leaf(kind).unwrap();
                for i in 0..3 {
                    leaf.store(&format!("{kind}-{i}"), format!("{kind} v1 {i}").as_bytes(), None)
                        .unwrap();
                }
            }
            tree.commit().unwrap();
        }
        {
            let mut tree = store.mutable_tree();
            let mut credentials = tree.credentials().unwrap();
            credentials.store("credentials-0", b"credentials v2", None).unwrap();
            credentials.delete("credentials-1");
            drop(credentials);
            tree.commit().unwrap();
        }

        let live = gc::live_set(store.objects(), &store.root().tree_hash()).unwrap();
        let report = store.collect_garbage().unwrap();
        assert_eq!(report.from, Bucket::A);
        assert_eq!(report.to, Bucket::B);
        assert_eq!(report.copied + report.skipped, live.len());
        assert_eq!(store.root().active_bucket(), Bucket::B);

        memory.clear_bucket(Bucket::A);
        assert_eq!(memory.count(Bucket::B).unwrap(), live.len());
        for kind in LeafKind::ALL {
            for (id, _) in store.list(kind).unwrap() {
                assert!(store.load(kind, &id, false).unwrap().is_some(), "{kind}/{id}");
            }
        }
        assert!(!store.exists(LeafKind::Credentials, "credentials-1").unwrap());

        // A second pass flips back and copies the same live set.
        let again = store.collect_garbage().unwrap();
        assert_eq!(again.to, Bucket::A);
        assert_eq!(again.copied, live.len());
    }

    #[test]
    fn snapshots_stay_consistent_across_flip() {
        let (_memory, store) = memory_store();
        put(&store, LeafKind::Contexts, "ctx", b"first");
        let before = store.tree();

        put(&store, LeafKind::Contexts, "ctx", b"second");
        store.collect_garbage().unwrap();

        let objects = store.objects();
        let old = before.index(objects, LeafKind::Contexts).unwrap();
        assert_eq!(old.load(objects, "ctx", false).unwrap().unwrap(), b"first");
        assert_eq!(store.load(LeafKind::Contexts, "ctx", false).unwrap().unwrap(), b"second");
    }

    #[test]
    fn storing_identical_content_is_idempotent() {
        let (memory, store) = memory_store();
        let first = put(&store, LeafKind::Seeds, "seed", b"mnemonic");
        let objects = memory.count(Bucket::A).unwrap();
        let hash = store.hash(LeafKind::Seeds, "seed").unwrap();

        let second = put(&store, LeafKind::Seeds, "seed", b"mnemonic");
        assert_eq!(first, second);
        assert_eq!(store.hash(LeafKind::Seeds, "seed").unwrap(), hash);
        assert_eq!(memory.count(Bucket::A).unwrap(), objects);
        assert_eq!(store.revision(LeafKind::Seeds, "seed").unwrap(), Some(1));
    }

    #[test]
    fn interrupted_gc_resumes_on_open() {
        let memory = Arc::new(MemoryDriver::new());
        {
            let store = Store::with_drivers(
                Arc::clone(&memory) as Arc<dyn Driver>,
                Vec::new(),
                StoreOptions::without_gc(),
            )
            .unwrap();
            put(&store, LeafKind::PaymentWorkflows, "p", b"workflow");
            // Crash after the flag was persisted.
            store.inner.root.begin_gc(store.inner.driver.as_ref()).unwrap();
        }

        let store = Store::with_drivers(
            Arc::clone(&memory) as Arc<dyn Driver>,
            Vec::new(),
            StoreOptions::without_gc(),
        )
        .unwrap();
        let root = store.root();
        assert!(!root.gc_in_progress());
        assert_eq!(root.active_bucket(), Bucket::B);
        assert!(root.gc_last_run() > 0);
        assert_eq!(store.load(LeafKind::PaymentWorkflows, "p", false).unwrap().unwrap(), b"workflow");
    }

    #[test]
    fn second_collection_is_refused_while_one_runs() {
        let (_memory, store) = memory_store();
        store.inner.root.begin_gc(store.inner.driver.as_ref()).unwrap();
        assert!(matches!(store.collect_garbage(), Err(StorageError::GcInProgress)));
        assert!(matches!(
            store.migrate(Arc::new(MemoryDriver::new())),
            Err(StorageError::GcInProgress)
        ));
    }

    #[test]
    fn shutdown_aborts_collection() {
        let (_memory, store) = memory_store();
        put(&store, LeafKind::Units, "u", b"unit");
        store.shutdown();
        assert!(matches!(store.collect_garbage(), Err(StorageError::GcAborted)));
        let root = store.root();
        assert!(!root.gc_in_progress());
        assert_eq!(root.active_bucket(), Bucket::A);
    }

    #[test]
    fn worker_runs_on_request() {
        let memory = Arc::new(MemoryDriver::new());
        let options = StoreOptions {
            gc: GcConfig {
                enabled: true,
                interval_secs: 3600,
                poll_secs: 3600,
            },
            ..StoreOptions::default()
        };
        let store = Store::with_drivers(Arc::clone(&memory) as Arc<dyn Driver>, Vec::new(), options)
            .unwrap();
        put(&store, LeafKind::Contacts, "c", b"contact");

        store.request_gc();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.root().gc_last_run() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(store.root().gc_last_run() > 0);
        store.shutdown();
        store.shutdown();
    }

    #[test]
    fn runtime_migration_switches_primary() {
        let (_memory, store) = memory_store();
        put(&store, LeafKind::Credentials, "id", b"credential");
        put(&store, LeafKind::Credentials, "id", b"credential v2");

        let target = Arc::new(SqliteDriver::open_in_memory().unwrap());
        let report = store.migrate(Arc::clone(&target) as Arc<dyn Driver>).unwrap();
        assert_eq!(report.to, "sqlite::memory:");
        // Tree, leaf and the current record; the first record is garbage.
        assert_eq!(report.copied, 3);
        assert_eq!(target.count(Bucket::A).unwrap(), 3);

        put(&store, LeafKind::Credentials, "other", b"after migration");
        assert!(target.load_root().unwrap().is_some());
        assert_eq!(
            store.load(LeafKind::Credentials, "id", false).unwrap().unwrap(),
            b"credential v2"
        );
        assert_eq!(store.root().sequence(), 3);
    }

    #[test]
    fn entity_locks_are_shared_per_id() {
        let (_memory, store) = memory_store();
        let a = store.entity_lock(LeafKind::Seeds, "wallet");
        let b = store.entity_lock(LeafKind::Seeds, "wallet");
        assert!(Arc::ptr_eq(&a, &b));
    }

    fn disk_config(dir: &std::path::Path, primary: BackendKind) -> StoreConfig {
        StoreConfig {
            primary,
            gc: GcConfig::disabled(),
            ..StoreConfig::new(dir)
        }
    }

    #[test]
    fn open_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let config = disk_config(dir.path(), BackendKind::Fs);
        {
            let store = Store::open(&config, Capabilities::default()).unwrap();
            put(&store, LeafKind::BlockchainTransactions, "tx1", b"raw tx");
        }
        let store = Store::open(&config, Capabilities::default()).unwrap();
        assert_eq!(store.root().sequence(), 1);
        assert_eq!(
            store.load(LeafKind::BlockchainTransactions, "tx1", false).unwrap().unwrap(),
            b"raw tx"
        );
        assert!(store.startup_migration().is_none());
        assert_eq!(recorded_backend(&config).unwrap(), Some(BackendKind::Fs));
    }

    #[test]
    fn changing_primary_migrates_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(&disk_config(dir.path(), BackendKind::Fs), Capabilities::default())
                .unwrap();
            put(&store, LeafKind::Threads, "t", b"thread");
        }

        let config = disk_config(dir.path(), BackendKind::Sqlite);
        let store = Store::open(&config, Capabilities::default()).unwrap();
        let report = store.startup_migration().unwrap();
        assert!(report.from.starts_with("fs:"));
        assert!(report.to.starts_with("sqlite:"));
        assert_eq!(store.load(LeafKind::Threads, "t", false).unwrap().unwrap(), b"thread");
        assert_eq!(store.root().sequence(), 1);
        assert_eq!(recorded_backend(&config).unwrap(), Some(BackendKind::Sqlite));
        drop(store);

        let store = Store::open(&config, Capabilities::default()).unwrap();
        assert!(store.startup_migration().is_none());
    }

    #[test]
    fn bad_backup_refuses_before_changeover() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(&disk_config(dir.path(), BackendKind::Fs), Capabilities::default())
                .unwrap();
            put(&store, LeafKind::Contacts, "bob", b"card");
        }

        let mut config = disk_config(dir.path(), BackendKind::Sqlite);
        config.backups.push(crate::config::BackupConfig {
            kind: BackendKind::Fs,
            path: None,
            encrypt: true,
        });
        let err = Store::open(&config, Capabilities::default()).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert_eq!(recorded_backend(&config).unwrap(), Some(BackendKind::Fs));

        let store = Store::open(&disk_config(dir.path(), BackendKind::Fs), Capabilities::default())
            .unwrap();
        assert_eq!(store.load(LeafKind::Contacts, "bob", false).unwrap().unwrap(), b"card");
    }

    #[test]
    fn encrypted_backup_holds_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = disk_config(dir.path(), BackendKind::Fs);
        config.backups.push(crate::config::BackupConfig {
            kind: BackendKind::Sqlite,
            path: None,
            encrypt: true,
        });

        let err = Store::open(&config, Capabilities::default()).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));

        let caps = Capabilities::default().with_backup_secret(b"backup secret");
        {
            let store = Store::open(&config, caps.clone()).unwrap();
            put(&store, LeafKind::Seeds, "seed", b"twelve words");
        }

        let raw = SqliteDriver::open(&config.backup_location(&config.backups[0])).unwrap();
        let sealed_root = raw.load_root().unwrap().unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&sealed_root).is_err());

        let raw: Arc<dyn Driver> = Arc::new(raw);
        let decrypted = EncryptedDriver::new(
            raw,
            BackupKey::derive(b"backup secret"),
            Arc::new(OsRandom),
        );
        let root: serde_json::Value =
            serde_json::from_slice(&decrypted.load_root().unwrap().unwrap()).unwrap();
        assert_eq!(root["sequence"], 1);

        // The backup alone is enough to serve the data.
        let restored = Store::with_drivers(
            Arc::new(decrypted),
            Vec::new(),
            StoreOptions::without_gc(),
        )
        .unwrap();
        assert_eq!(restored.load(LeafKind::Seeds, "seed", false).unwrap().unwrap(), b"twelve words");
    }
}
