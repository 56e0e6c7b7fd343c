use cask_types::Hash;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::objects::Objects;

/// A serializable, content-addressed unit of the persistent tree.
///
/// Nodes encode as JSON and carry a format version; decoding rejects
/// versions newer than [`Node::VERSION`]. The null hash stands for the empty
/// node, so a fresh store needs no objects at all.
///
/// Nodes track whether they changed since they were loaded. Saving a clean
/// node is allowed and yields the same hash again.
pub trait Node: Clone + Default + Serialize + DeserializeOwned {
    /// Name used in logs and errors.
    const KIND: &'static str;

    /// Newest format version this build reads and writes.
    const VERSION: u32;

    /// Format version of this instance.
    fn version(&self) -> u32;

    /// Whether the node changed since it was loaded or saved.
    fn is_dirty(&self) -> bool;

    fn set_dirty(&mut self, dirty: bool);

    /// Hashes of objects this node points at.
    fn references(&self) -> Vec<Hash>;

    /// Encode to canonical bytes.
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Decode bytes fetched under `hash`.
    fn from_bytes(hash: &Hash, bytes: &[u8]) -> StorageResult<Self> {
        let node: Self = serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
            hash: *hash,
            reason: format!("{}: {e}", Self::KIND),
        })?;
        if node.version() > Self::VERSION {
            return Err(StorageError::Corrupt {
                hash: *hash,
                reason: format!("{}: unsupported version {}", Self::KIND, node.version()),
            });
        }
        Ok(node)
    }

    /// Load the node stored under `hash`. Missing objects are an error.
    fn load(objects: &Objects, hash: &Hash) -> StorageResult<Self> {
        Self::load_checking(objects, hash)?
            .ok_or_else(|| StorageError::object_not_found(Self::KIND, hash))
    }

    /// Load the node stored under `hash`, or `None` if the object is absent.
    fn load_checking(objects: &Objects, hash: &Hash) -> StorageResult<Option<Self>> {
        if hash.is_null() {
            return Ok(Some(Self::default()));
        }
        match objects.get(hash)? {
            Some(bytes) => Self::from_bytes(hash, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Persist the node and clear its dirty flag.
    fn save(&mut self, objects: &Objects) -> StorageResult<Hash> {
        let bytes = self.to_bytes()?;
        let hash = objects.put(&bytes)?;
        self.set_dirty(false);
        debug!(kind = Self::KIND, hash = %hash.short_hex(), len = bytes.len(), "node saved");
        Ok(hash)
    }
}
