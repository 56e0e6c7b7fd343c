//! Leaf indices: logical id -> content hash, alias and revision.
//!
//! A leaf index never holds record bytes. Records are opaque objects in the
//! driver; the index only names their current hash, so a logical entity can
//! change content while keeping its id.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cask_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::editor::Editor;
use crate::error::{StorageError, StorageResult};
use crate::node::Node;
use crate::objects::Objects;

/// The closed set of leaf indices a tree holds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    #[default]
    Accounts,
    BlockchainTransactions,
    Contacts,
    Contexts,
    Credentials,
    Issuers,
    PaymentWorkflows,
    Seeds,
    Threads,
    Units,
}

impl LeafKind {
    /// Every kind, in tree slot order.
    pub const ALL: [LeafKind; 10] = [
        LeafKind::Accounts,
        LeafKind::BlockchainTransactions,
        LeafKind::Contacts,
        LeafKind::Contexts,
        LeafKind::Credentials,
        LeafKind::Issuers,
        LeafKind::PaymentWorkflows,
        LeafKind::Seeds,
        LeafKind::Threads,
        LeafKind::Units,
    ];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            LeafKind::Accounts => "accounts",
            LeafKind::BlockchainTransactions => "blockchain_transactions",
            LeafKind::Contacts => "contacts",
            LeafKind::Contexts => "contexts",
            LeafKind::Credentials => "credentials",
            LeafKind::Issuers => "issuers",
            LeafKind::PaymentWorkflows => "payment_workflows",
            LeafKind::Seeds => "seeds",
            LeafKind::Threads => "threads",
            LeafKind::Units => "units",
        }
    }
}

impl fmt::Display for LeafKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeafKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        LeafKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| StorageError::Config(format!("unknown leaf kind: {s}")))
    }
}

/// One logical entity in a leaf index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Hash of the current record.
    pub hash: Hash,
    /// Caller-chosen display name; empty when unset.
    #[serde(default)]
    pub alias: String,
    /// Starts at 1, bumped on every content change.
    pub revision: u64,
}

/// Current on-disk version of [`Index`].
pub const INDEX_VERSION: u32 = 1;

/// Leaf index node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Index {
    version: u32,
    entries: BTreeMap<String, Entry>,
    #[serde(skip)]
    kind: LeafKind,
    #[serde(skip)]
    dirty: bool,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
            kind: LeafKind::default(),
            dirty: false,
        }
    }
}

impl Index {
    /// An empty index for `kind`.
    pub fn new(kind: LeafKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// The kind this index belongs to.
    pub fn kind(&self) -> LeafKind {
        self.kind
    }

    pub(crate) fn bind(&mut self, kind: LeafKind) {
        self.kind = kind;
    }

    /// Load the record behind `id`.
    ///
    /// With `checking`, a missing id or object yields `Ok(None)`; otherwise
    /// it is a `NotFound` error.
    pub fn load(&self, objects: &Objects, id: &str, checking: bool) -> StorageResult<Option<Vec<u8>>> {
        let Some(entry) = self.entries.get(id) else {
            return if checking {
                Ok(None)
            } else {
                Err(StorageError::entry_not_found(self.kind, id))
            };
        };
        match objects.get(&entry.hash)? {
            Some(bytes) => Ok(Some(bytes)),
            None if checking => Ok(None),
            None => Err(StorageError::object_not_found(self.kind.as_str(), &entry.hash)),
        }
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn alias(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|e| e.alias.as_str())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn hash(&self, id: &str) -> Option<Hash> {
        self.entries.get(id).map(|e| e.hash)
    }

    pub fn revision(&self, id: &str) -> Option<u64> {
        self.entries.get(id).map(|e| e.revision)
    }

    /// `(id, alias)` pairs in id order.
    pub fn list(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.alias.clone()))
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Node for Index {
    const KIND: &'static str = "index";
    const VERSION: u32 = INDEX_VERSION;

    fn version(&self) -> u32 {
        self.version
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn references(&self) -> Vec<Hash> {
        self.entries.values().map(|e| e.hash).collect()
    }
}

impl Editor<'_, Index> {
    /// Point `id` at `record`, writing the record unless it is already
    /// stored under that id.
    ///
    /// `alias` replaces the current alias when given. Returns `true` if the
    /// content changed (new entry or new hash).
    pub fn store(&mut self, id: &str, record: &[u8], alias: Option<&str>) -> StorageResult<bool> {
        let hash = self.objects().hash(record);
        let kind = self.kind;

        if let Some(entry) = self.entries.get(id) {
            if entry.hash == hash {
                if let Some(alias) = alias {
                    if entry.alias != alias {
                        let index = self.node_mut();
                        if let Some(entry) = index.entries.get_mut(id) {
                            entry.alias = alias.to_string();
                        }
                        index.dirty = true;
                    }
                }
                debug!(%kind, id, hash = %hash.short_hex(), "record unchanged");
                return Ok(false);
            }
        }

        self.objects().put(record)?;
        let index = self.node_mut();
        let entry = index
            .entries
            .entry(id.to_string())
            .and_modify(|e| {
                e.hash = hash;
                e.revision += 1;
            })
            .or_insert_with(|| Entry {
                hash,
                alias: String::new(),
                revision: 1,
            });
        if let Some(alias) = alias {
            entry.alias = alias.to_string();
        }
        let revision = entry.revision;
        index.dirty = true;
        debug!(%kind, id, hash = %hash.short_hex(), revision, "record stored");
        Ok(true)
    }

    /// Rename the entity behind `id`.
    pub fn set_alias(&mut self, id: &str, alias: &str) -> StorageResult<()> {
        let kind = self.kind;
        let index = self.node_mut();
        let entry = index
            .entries
            .get_mut(id)
            .ok_or_else(|| StorageError::entry_not_found(kind, id))?;
        if entry.alias != alias {
            entry.alias = alias.to_string();
            index.dirty = true;
        }
        Ok(())
    }

    /// Drop the entry for `id`. The record bytes stay until collected.
    pub fn delete(&mut self, id: &str) -> bool {
        let index = self.node_mut();
        let removed = index.entries.remove(id).is_some();
        if removed {
            index.dirty = true;
            debug!(kind = %index.kind, id, "entry deleted");
        }
        removed
    }
}
