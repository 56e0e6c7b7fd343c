use std::sync::Arc;

use cask_types::{Bucket, Hash};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::traits::Driver;

/// Result of a backend migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    /// Name of the primary before the switch.
    pub from: String,
    /// Name of the primary after the switch.
    pub to: String,
    /// Objects written into the target.
    pub copied: usize,
    /// Objects the target already held.
    pub skipped: usize,
}

/// Fan-out / fallback layer over one primary and any number of backups.
///
/// - Writes go to every driver. Only the primary must succeed; a failing
///   secondary is logged and ignored so the authoritative copy stays
///   available.
/// - Reads try the primary first, then secondaries in registration order,
///   and return the first hit. A miss is an error only if the primary
///   failed; secondary read failures are logged.
///
/// `Multiplex` implements [`Driver`] itself, so the layers above see a single
/// backend.
pub struct Multiplex {
    primary: RwLock<Arc<dyn Driver>>,
    secondaries: RwLock<Vec<Arc<dyn Driver>>>,
}

impl Multiplex {
    /// Create a multiplex with no secondaries.
    pub fn new(primary: Arc<dyn Driver>) -> Self {
        Self {
            primary: RwLock::new(primary),
            secondaries: RwLock::new(Vec::new()),
        }
    }

    /// Create a multiplex with the given secondaries.
    pub fn with_secondaries(primary: Arc<dyn Driver>, secondaries: Vec<Arc<dyn Driver>>) -> Self {
        Self {
            primary: RwLock::new(primary),
            secondaries: RwLock::new(secondaries),
        }
    }

    /// Register an additional backup driver.
    pub fn add_secondary(&self, driver: Arc<dyn Driver>) {
        info!(driver = driver.name(), "backup driver registered");
        self.secondaries.write().push(driver);
    }

    /// The current primary.
    pub fn primary(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.primary.read())
    }

    /// Snapshot of the registered secondaries.
    pub fn secondaries(&self) -> Vec<Arc<dyn Driver>> {
        self.secondaries.read().clone()
    }

    /// Primary followed by secondaries, captured at one instant.
    fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        let mut drivers = vec![self.primary()];
        drivers.extend(self.secondaries.read().iter().cloned());
        drivers
    }

    fn fan_out(
        &self,
        what: &str,
        op: impl Fn(&dyn Driver) -> DriverResult<()>,
    ) -> DriverResult<()> {
        let drivers = self.drivers();
        let (primary, secondaries) = drivers.split_at(1);
        op(primary[0].as_ref())?;
        for driver in secondaries {
            if let Err(e) = op(driver.as_ref()) {
                warn!(driver = driver.name(), error = %e, "secondary {what} failed");
            }
        }
        Ok(())
    }

    fn first_hit(
        &self,
        what: &str,
        op: impl Fn(&dyn Driver) -> DriverResult<Option<Vec<u8>>>,
    ) -> DriverResult<Option<Vec<u8>>> {
        let drivers = self.drivers();
        let (primary, secondaries) = drivers.split_at(1);
        // A miss is only trustworthy if the primary answered; a dead
        // secondary cannot turn the primary's miss into an error.
        let primary_error = match op(primary[0].as_ref()) {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => None,
            Err(e) => {
                warn!(driver = primary[0].name(), error = %e, "{what} failed; trying backups");
                Some(e)
            }
        };
        for driver in secondaries {
            match op(driver.as_ref()) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => warn!(driver = driver.name(), error = %e, "secondary {what} failed"),
            }
        }
        match primary_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Whether every driver that can answer holds `key` in `bucket`.
    ///
    /// The primary must answer. A secondary that fails is logged and not
    /// counted as missing, since a copy could not reach it either.
    pub fn held_by_all(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        let drivers = self.drivers();
        let (primary, secondaries) = drivers.split_at(1);
        if !primary[0].exists(key, bucket)? {
            return Ok(false);
        }
        for driver in secondaries {
            match driver.exists(key, bucket) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => warn!(driver = driver.name(), error = %e, "secondary exists failed"),
            }
        }
        Ok(true)
    }

    /// Copy the live object set and the root into `target`, then make it
    /// the primary.
    ///
    /// Every key in `live` is read from `bucket` (falling back to the other
    /// bucket) and written into `target` under `bucket`. The switch happens
    /// only after the target returns the copied root unchanged; on any error
    /// the current primary stays authoritative. The old primary is dropped.
    ///
    /// Callers must keep writers out for the duration.
    pub fn migrate(
        &self,
        target: Arc<dyn Driver>,
        live: &[Hash],
        bucket: Bucket,
    ) -> DriverResult<MigrationReport> {
        let mut copied = 0;
        let mut skipped = 0;

        for key in live {
            if target.exists(key, bucket)? {
                skipped += 1;
                continue;
            }
            let value = match self.load(key, bucket)? {
                Some(value) => value,
                None => self.load(key, bucket.other())?.ok_or_else(|| {
                    DriverError::Migration(format!("live object {key} is missing"))
                })?,
            };
            target.store(key, &value, bucket)?;
            copied += 1;
            debug!(key = %key.short_hex(), target = target.name(), "object migrated");
        }

        let root = self
            .load_root()?
            .ok_or_else(|| DriverError::Migration("source has no root".into()))?;
        target.store_root(&root)?;
        if target.load_root()?.as_deref() != Some(root.as_slice()) {
            return Err(DriverError::Migration(format!(
                "root did not round-trip through {}",
                target.name()
            )));
        }

        let to = target.name().to_string();
        let old = std::mem::replace(&mut *self.primary.write(), target);
        let report = MigrationReport {
            from: old.name().to_string(),
            to,
            copied,
            skipped,
        };
        info!(
            from = %report.from,
            to = %report.to,
            copied,
            skipped,
            "primary driver switched"
        );
        Ok(report)
    }
}

impl Driver for Multiplex {
    fn name(&self) -> &str {
        "multiplex"
    }

    fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> DriverResult<()> {
        self.fan_out("store", |d| d.store(key, value, bucket))
    }

    fn load(&self, key: &Hash, bucket: Bucket) -> DriverResult<Option<Vec<u8>>> {
        self.first_hit("load", |d| d.load(key, bucket))
    }

    /// Asks the primary only. See [`Multiplex::held_by_all`].
    fn exists(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        self.primary().exists(key, bucket)
    }

    fn store_root(&self, value: &[u8]) -> DriverResult<()> {
        self.fan_out("store_root", |d| d.store_root(value))
    }

    fn load_root(&self) -> DriverResult<Option<Vec<u8>>> {
        self.first_hit("load_root", |d| d.load_root())
    }

    fn count(&self, bucket: Bucket) -> DriverResult<usize> {
        self.primary().count(bucket)
    }
}

impl std::fmt::Debug for Multiplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secondaries: Vec<String> = self
            .secondaries
            .read()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        f.debug_struct("Multiplex")
            .field("primary", &self.primary().name())
            .field("secondaries", &secondaries)
            .finish()
    }
}
