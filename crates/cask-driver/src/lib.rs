//! Backend drivers for the cask storage engine.
//!
//! A driver is a dumb, hash-keyed byte store with two content buckets and one
//! overwritable root slot. Drivers never interpret what they hold; hashing,
//! node layout and reachability live in `cask-storage`.
//!
//! # Drivers
//!
//! All backends implement the [`Driver`] trait:
//!
//! - [`MemoryDriver`] -- `HashMap`-based driver for tests and embedding
//! - [`FsDriver`] -- flat files under a data directory
//! - [`SqliteDriver`] -- tables `a`, `b` and `control` in an embedded database
//! - [`EncryptedDriver`] -- wraps another driver with AES-256-GCM
//! - [`Multiplex`] -- fans writes out to a primary plus backups, reads with fallback
//!
//! # Design Rules
//!
//! 1. Object writes are idempotent: re-storing a key is a no-op success.
//! 2. The root slot is always overwritten, never merged.
//! 3. All I/O errors are propagated, never silently ignored.
//! 4. Readers never block on writers longer than a single key operation.

pub mod encrypted;
pub mod error;
pub mod fs;
pub mod memory;
pub mod multiplex;
pub mod sqlite;
pub mod traits;

pub use encrypted::EncryptedDriver;
pub use error::{DriverError, DriverResult};
pub use fs::FsDriver;
pub use memory::MemoryDriver;
pub use multiplex::{MigrationReport, Multiplex};
pub use sqlite::SqliteDriver;
pub use traits::Driver;
