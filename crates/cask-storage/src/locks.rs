use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::index::LeafKind;

/// Table size above which idle locks are dropped on the next lookup.
const PRUNE_THRESHOLD: usize = 1024;

/// One mutex per logical entity.
///
/// Lets callers serialize their own read-modify-write sequences on a single
/// entity without holding the store write lock while they prepare the new
/// record. Locks are created on first use and dropped once nobody holds a
/// handle.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<(LeafKind, String), Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `id` in the `kind` leaf.
    pub fn get(&self, kind: LeafKind, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(
            locks
                .entry((kind, id.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
