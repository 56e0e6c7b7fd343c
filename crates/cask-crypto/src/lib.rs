//! Cryptographic capabilities for the cask storage engine.
//!
//! The engine consumes hashing and randomness through the [`Digest`] and
//! [`Random`] traits so that callers can substitute their own primitives.
//! Defaults are domain-separated BLAKE3 ([`ContentHasher`]) and the operating
//! system RNG ([`OsRandom`]).
//!
//! [`cipher`] provides the AES-256-GCM sealing used by encrypted backup
//! drivers. All crypto operations wrap established libraries — no custom
//! cryptography.

pub mod cipher;
pub mod hasher;
pub mod random;

pub use cipher::{open, seal, BackupKey, CipherError};
pub use hasher::{ContentHasher, Digest};
pub use random::{OsRandom, Random};
