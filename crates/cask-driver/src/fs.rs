use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cask_types::{Bucket, Hash};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DriverError, DriverResult};
use crate::traits::Driver;

/// Header size: 4 bytes CRC32 of the payload.
const HEADER_SIZE: usize = 4;

const ROOT_FILE: &str = "root";

/// Filesystem driver: one file per object.
///
/// On-disk layout:
/// ```text
/// <dir>/root                    control slot
/// <dir>/a/<hh>/<64 hex chars>   bucket A objects, fanned out by first byte
/// <dir>/b/<hh>/<64 hex chars>   bucket B objects
/// ```
///
/// Every file is framed as `[4 bytes: CRC32 (LE u32)] [N bytes: payload]`.
/// Files are written to a temporary sibling and renamed into place, so a
/// crash leaves either the previous file or the complete new one.
#[derive(Debug)]
pub struct FsDriver {
    dir: PathBuf,
    name: String,
}

impl FsDriver {
    /// Open (or create) a data directory.
    pub fn open(dir: &Path) -> DriverResult<Self> {
        for bucket in Bucket::ALL {
            fs::create_dir_all(dir.join(bucket.as_str()))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            name: format!("fs:{}", dir.display()),
        })
    }

    /// The data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn object_path(&self, key: &Hash, bucket: Bucket) -> PathBuf {
        let hex = key.to_hex();
        self.dir
            .join(bucket.as_str())
            .join(&hex[..2])
            .join(hex)
    }

    fn write_atomic(path: &Path, payload: &[u8]) -> DriverResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        tmp.write_all(payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| DriverError::Io(e.error))?;
        Ok(())
    }

    fn read_framed(path: &Path, key: Option<&Hash>) -> DriverResult<Option<Vec<u8>>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| match key {
            Some(key) => DriverError::corrupt(key, reason),
            None => DriverError::Corrupt {
                key: ROOT_FILE.into(),
                reason,
            },
        };

        if raw.len() < HEADER_SIZE {
            return Err(corrupt(format!("truncated file ({} bytes)", raw.len())));
        }
        let (header, payload) = raw.split_at(HEADER_SIZE);
        let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(corrupt(format!(
                "CRC mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }
        Ok(Some(payload.to_vec()))
    }
}

impl Driver for FsDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> DriverResult<()> {
        let path = self.object_path(key, bucket);
        if path.exists() {
            return Ok(());
        }
        Self::write_atomic(&path, value)?;
        debug!(driver = %self.name, %bucket, key = %key.short_hex(), len = value.len(), "object written");
        Ok(())
    }

    fn load(&self, key: &Hash, bucket: Bucket) -> DriverResult<Option<Vec<u8>>> {
        Self::read_framed(&self.object_path(key, bucket), Some(key))
    }

    fn exists(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        Ok(self.object_path(key, bucket).is_file())
    }

    fn store_root(&self, value: &[u8]) -> DriverResult<()> {
        Self::write_atomic(&self.dir.join(ROOT_FILE), value)
    }

    fn load_root(&self) -> DriverResult<Option<Vec<u8>>> {
        Self::read_framed(&self.dir.join(ROOT_FILE), None)
    }

    fn count(&self, bucket: Bucket) -> DriverResult<usize> {
        let mut count = 0;
        for entry in WalkDir::new(self.dir.join(bucket.as_str())).min_depth(2) {
            let entry = entry.map_err(|e| {
                DriverError::Io(e.into_io_error().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "filesystem loop")
                }))
            })?;
            let is_object = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .map(|name| Hash::from_hex(name).is_ok())
                    .unwrap_or(false);
            if is_object {
                count += 1;
            }
        }
        Ok(count)
    }
}
