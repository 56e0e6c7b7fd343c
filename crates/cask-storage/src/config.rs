use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cask_driver::{Driver, FsDriver, MemoryDriver, SqliteDriver};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// File under the data directory that remembers the primary backend.
pub const BACKEND_MARKER: &str = "backend.toml";

/// Backend implementations a store can be opened on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Fs,
    Sqlite,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Fs => "fs",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Memory => "memory",
        }
    }

    /// Where this backend lives when no explicit path is configured.
    pub fn default_location(self, data_dir: &Path) -> PathBuf {
        match self {
            BackendKind::Fs => data_dir.join("objects"),
            BackendKind::Sqlite => data_dir.join("cask.sqlite"),
            BackendKind::Memory => PathBuf::new(),
        }
    }

    /// Open a driver of this kind at `location`.
    pub fn open(self, location: &Path) -> StorageResult<Arc<dyn Driver>> {
        debug!(backend = self.as_str(), location = %location.display(), "opening backend");
        let driver: Arc<dyn Driver> = match self {
            BackendKind::Fs => Arc::new(FsDriver::open(location)?),
            BackendKind::Sqlite => Arc::new(SqliteDriver::open(location)?),
            BackendKind::Memory => Arc::new(MemoryDriver::new()),
        };
        Ok(driver)
    }

    /// Whether data written through this backend outlives the process.
    pub fn is_persistent(self) -> bool {
        !matches!(self, BackendKind::Memory)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fs" | "file" | "files" => Ok(BackendKind::Fs),
            "sqlite" => Ok(BackendKind::Sqlite),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(StorageError::Config(format!("unknown backend: {other}"))),
        }
    }
}

/// Garbage collection schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run the background worker.
    pub enabled: bool,
    /// Minimum seconds between passes.
    pub interval_secs: u64,
    /// How often the worker checks whether a pass is due.
    pub poll_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            poll_secs: 60,
        }
    }
}

impl GcConfig {
    /// No background worker; passes only run when asked for.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// One backup driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub kind: BackendKind,
    /// Relative paths resolve against the data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Seal values with the backup key.
    #[serde(default)]
    pub encrypt: bool,
}

/// Top-level store configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub primary: BackendKind,
    pub gc: GcConfig,
    pub backups: Vec<BackupConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("cask-data"),
            primary: BackendKind::default(),
            gc: GcConfig::default(),
            backups: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// A config rooted at `data_dir` with everything else defaulted.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> StorageResult<Self> {
        toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Read a TOML config file.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> StorageResult<String> {
        toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))
    }

    pub fn primary_location(&self) -> PathBuf {
        self.primary.default_location(&self.data_dir)
    }

    pub fn backup_location(&self, backup: &BackupConfig) -> PathBuf {
        match &backup.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.data_dir.join(path),
            None => backup.kind.default_location(&self.data_dir.join("backup")),
        }
    }
}

/// Contents of the backend marker file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BackendMarker {
    pub primary: BackendKind,
}

impl BackendMarker {
    fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(BACKEND_MARKER)
    }

    /// The backend recorded under `data_dir`, if any.
    pub(crate) fn read(data_dir: &Path) -> StorageResult<Option<BackendKind>> {
        let text = match fs::read_to_string(Self::path(data_dir)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker: Self = toml::from_str(&text)
            .map_err(|e| StorageError::Config(format!("{BACKEND_MARKER}: {e}")))?;
        Ok(Some(marker.primary))
    }

    pub(crate) fn write(data_dir: &Path, primary: BackendKind) -> StorageResult<()> {
        let text = toml::to_string(&Self { primary })
            .map_err(|e| StorageError::Config(e.to_string()))?;
        fs::write(Self::path(data_dir), text)?;
        Ok(())
    }
}
