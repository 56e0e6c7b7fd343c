//! Foundation types for the cask storage engine.
//!
//! Every other cask crate depends on `cask-types`.
//!
//! # Key Types
//!
//! - [`Hash`] — Content-addressed identifier (digest of an object's bytes)
//! - [`Bucket`] — One of the two physical namespaces inside a driver

pub mod bucket;
pub mod error;
pub mod hash;

pub use bucket::Bucket;
pub use error::TypeError;
pub use hash::Hash;
