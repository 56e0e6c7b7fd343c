//! Content-addressed, garbage-collected persistence engine.
//!
//! Every persisted aggregate is a [`Node`] whose identity is the hash of its
//! serialized bytes. A single mutable [`Root`] names the current [`Tree`];
//! the tree names one leaf [`Index`] per [`LeafKind`]; leaves name opaque
//! records by hash. Nothing is edited in place: writers get a copy through
//! an [`Editor`], and the new snapshot becomes visible only when the root is
//! persisted.
//!
//! # Key Types
//!
//! - [`Store`] — the facade: open, write through `mutable_tree`, read per leaf
//! - [`Editor`] — scoped write access that saves and links on completion
//! - [`Index`] / [`Entry`] — logical id to content hash, alias and revision
//! - [`RootRecord`] — sequence, tree hash, active bucket and GC bookkeeping
//! - [`GcReport`] — outcome of one copying collection
//!
//! # Example
//!
//! ```no_run
//! use cask_storage::{Capabilities, LeafKind, Store, StoreConfig};
//!
//! let store = Store::open(&StoreConfig::new("cask-data"), Capabilities::default())?;
//! let mut tree = store.mutable_tree();
//! tree.credentials()?.store("licence", b"...", Some("Driver licence"))?;
//! tree.commit()?;
//!
//! let record = store.load(LeafKind::Credentials, "licence", false)?;
//! # Ok::<(), cask_storage::StorageError>(())
//! ```

pub mod config;
pub mod editor;
pub mod error;
pub mod gc;
pub mod index;
pub mod locks;
pub mod node;
pub mod objects;
pub mod root;
pub mod store;
pub mod tree;

pub use config::{BackendKind, BackupConfig, GcConfig, StoreConfig, BACKEND_MARKER};
pub use editor::Editor;
pub use error::{StorageError, StorageResult};
pub use gc::GcReport;
pub use index::{Entry, Index, LeafKind};
pub use locks::LockTable;
pub use node::Node;
pub use objects::Objects;
pub use root::{Root, RootRecord};
pub use store::{recorded_backend, Capabilities, Store, StoreOptions};
pub use tree::Tree;

pub use cask_driver::MigrationReport;
pub use cask_types::{Bucket, Hash};
