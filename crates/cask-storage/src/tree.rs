use std::sync::{Arc, OnceLock};

use cask_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::editor::Editor;
use crate::error::StorageResult;
use crate::index::{Index, LeafKind};
use crate::node::Node;
use crate::objects::Objects;

/// Current on-disk version of [`Tree`].
pub const TREE_VERSION: u32 = 1;

/// One leaf reference: the persisted hash plus a lazily loaded copy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct Slot {
    hash: Hash,
    #[serde(skip)]
    cache: OnceLock<Arc<Index>>,
}

/// Second-level node: one fixed slot per [`LeafKind`].
///
/// Serialized as the ten leaf hashes. Leaves are loaded on first access and
/// cached in the tree instance; cloning a tree shares the cached leaves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tree {
    version: u32,
    accounts: Slot,
    blockchain_transactions: Slot,
    contacts: Slot,
    contexts: Slot,
    credentials: Slot,
    issuers: Slot,
    payment_workflows: Slot,
    seeds: Slot,
    threads: Slot,
    units: Slot,
    #[serde(skip)]
    dirty: bool,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            version: TREE_VERSION,
            accounts: Slot::default(),
            blockchain_transactions: Slot::default(),
            contacts: Slot::default(),
            contexts: Slot::default(),
            credentials: Slot::default(),
            issuers: Slot::default(),
            payment_workflows: Slot::default(),
            seeds: Slot::default(),
            threads: Slot::default(),
            units: Slot::default(),
            dirty: false,
        }
    }
}

impl Tree {
    fn slot(&self, kind: LeafKind) -> &Slot {
        match kind {
            LeafKind::Accounts => &self.accounts,
            LeafKind::BlockchainTransactions => &self.blockchain_transactions,
            LeafKind::Contacts => &self.contacts,
            LeafKind::Contexts => &self.contexts,
            LeafKind::Credentials => &self.credentials,
            LeafKind::Issuers => &self.issuers,
            LeafKind::PaymentWorkflows => &self.payment_workflows,
            LeafKind::Seeds => &self.seeds,
            LeafKind::Threads => &self.threads,
            LeafKind::Units => &self.units,
        }
    }

    fn slot_mut(&mut self, kind: LeafKind) -> &mut Slot {
        match kind {
            LeafKind::Accounts => &mut self.accounts,
            LeafKind::BlockchainTransactions => &mut self.blockchain_transactions,
            LeafKind::Contacts => &mut self.contacts,
            LeafKind::Contexts => &mut self.contexts,
            LeafKind::Credentials => &mut self.credentials,
            LeafKind::Issuers => &mut self.issuers,
            LeafKind::PaymentWorkflows => &mut self.payment_workflows,
            LeafKind::Seeds => &mut self.seeds,
            LeafKind::Threads => &mut self.threads,
            LeafKind::Units => &mut self.units,
        }
    }

    /// Persisted hash of the `kind` leaf (null when empty).
    pub fn leaf_hash(&self, kind: LeafKind) -> Hash {
        self.slot(kind).hash
    }

    /// Read-only view of the `kind` leaf, loading it on first access.
    pub fn index(&self, objects: &Objects, kind: LeafKind) -> StorageResult<Arc<Index>> {
        let slot = self.slot(kind);
        if let Some(index) = slot.cache.get() {
            return Ok(Arc::clone(index));
        }
        let mut index = <Index as Node>::load(objects, &slot.hash)?;
        index.bind(kind);
        debug!(%kind, hash = %slot.hash.short_hex(), entries = index.len(), "leaf loaded");
        // A concurrent reader may have won the race; either copy is identical.
        Ok(Arc::clone(slot.cache.get_or_init(|| Arc::new(index))))
    }

    /// Move the `kind` leaf out for editing.
    fn take_leaf(&mut self, objects: &Objects, kind: LeafKind) -> StorageResult<Index> {
        let index = self.index(objects, kind)?;
        self.slot_mut(kind).cache = OnceLock::new();
        Ok(Arc::unwrap_or_clone(index))
    }

    /// Put an edited leaf back and record its hash.
    fn restore_leaf(&mut self, kind: LeafKind, hash: Hash, index: Index) {
        let slot = self.slot_mut(kind);
        let changed = slot.hash != hash;
        slot.hash = hash;
        slot.cache = OnceLock::from(Arc::new(index));
        if changed {
            self.dirty = true;
        }
    }
}

impl Node for Tree {
    const KIND: &'static str = "tree";
    const VERSION: u32 = TREE_VERSION;

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
        LeafKind::ALL
            .into_iter()
            .map(|kind| self.leaf_hash(kind))
            .filter(|hash| !hash.is_null())
            .collect()
    }
}

impl Editor<'_, Tree> {
    /// Open the `kind` leaf for editing.
    ///
    /// Finishing the returned editor saves the leaf (if it changed) and
    /// writes its new hash into this tree's slot.
    pub fn leaf(&mut self, kind: LeafKind) -> StorageResult<Editor<'_, Index>> {
        let objects = self.objects().clone();
        let tree = self.node_mut();
        let index = tree.take_leaf(&objects, kind)?;
        let previous = tree.leaf_hash(kind);
        Ok(Editor::new(
            index,
            objects,
            Box::new(move |mut index: Index, objects: &Objects| {
                let hash = if index.is_dirty() {
                    index.save(objects)?
                } else {
                    previous
                };
                tree.restore_leaf(kind, hash, index);
                Ok(hash)
            }),
        ))
    }

    pub fn accounts(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Accounts)
    }

    pub fn blockchain_transactions(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::BlockchainTransactions)
    }

    pub fn contacts(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Contacts)
    }

    pub fn contexts(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Contexts)
    }

    pub fn credentials(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Credentials)
    }

    pub fn issuers(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Issuers)
    }

    pub fn payment_workflows(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::PaymentWorkflows)
    }

    pub fn seeds(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Seeds)
    }

    pub fn threads(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Threads)
    }

    pub fn units(&mut self) -> StorageResult<Editor<'_, Index>> {
        self.leaf(LeafKind::Units)
    }
}
