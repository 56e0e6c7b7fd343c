use std::ops::Deref;

use cask_types::Hash;
use tracing::{debug, error};

use crate::error::StorageResult;
use crate::node::Node;
use crate::objects::Objects;

/// Callback that persists a finished node and links it into its parent.
pub(crate) type OnCommit<'a, T> = Box<dyn FnOnce(T, &Objects) -> StorageResult<Hash> + 'a>;

/// Scoped, exclusive write access to one node.
///
/// An editor is the only way to mutate persisted state. Reads go through
/// `Deref`; mutations are inherent methods on `Editor<'_, Index>` and
/// `Editor<'_, Tree>`, so a plain node can never be changed in place.
///
/// The edit ends in exactly one of three ways:
/// - [`Editor::commit`] saves and links the node, returning its hash
/// - [`Editor::abort`] discards every change
/// - dropping the editor commits implicitly; a failure is logged
///
/// Editors nest: a tree editor hands out leaf editors that borrow it, so a
/// leaf has to be finished before the tree can be committed.
pub struct Editor<'a, T: Node> {
    node: T,
    objects: Objects,
    on_commit: Option<OnCommit<'a, T>>,
}

impl<'a, T: Node> Editor<'a, T> {
    pub(crate) fn new(node: T, objects: Objects, on_commit: OnCommit<'a, T>) -> Self {
        Self {
            node,
            objects,
            on_commit: Some(on_commit),
        }
    }

    /// Save the node and link it into its parent.
    pub fn commit(mut self) -> StorageResult<Hash> {
        match self.on_commit.take() {
            Some(on_commit) => on_commit(std::mem::take(&mut self.node), &self.objects),
            None => unreachable!("editor finished twice"),
        }
    }

    /// Discard every change made through this editor.
    pub fn abort(mut self) {
        self.on_commit = None;
        debug!(kind = T::KIND, "edit aborted");
    }

    pub(crate) fn node_mut(&mut self) -> &mut T {
        &mut self.node
    }

    pub(crate) fn objects(&self) -> &Objects {
        &self.objects
    }
}

impl<T: Node> Deref for Editor<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Node> Drop for Editor<'_, T> {
    fn drop(&mut self) {
        if let Some(on_commit) = self.on_commit.take() {
            if let Err(e) = on_commit(std::mem::take(&mut self.node), &self.objects) {
                error!(kind = T::KIND, error = %e, "implicit commit on drop failed");
            }
        }
    }
}

impl<T: Node + std::fmt::Debug> std::fmt::Debug for Editor<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("node", &self.node)
            .field("pending", &self.on_commit.is_some())
            .finish()
    }
}
