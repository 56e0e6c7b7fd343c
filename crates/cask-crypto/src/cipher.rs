//! AES-256-GCM sealing for encrypted backup drivers.
//!
//! Sealed payloads are laid out as `nonce (12 bytes) || ciphertext || tag`.
//! Nonces are drawn from the supplied [`Random`] capability. Callers pass
//! associated data (the storage key) so that a ciphertext cannot be moved to
//! a different key without failing authentication.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::random::Random;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

const KEY_CONTEXT: &str = "cask 2024 backup encryption key v1";

/// Errors from sealing and opening payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed")]
    SealFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    OpenFailed,

    #[error("ciphertext too short: must be at least {NONCE_LEN} bytes")]
    TooShort,
}

/// Symmetric key for encrypted backups, derived from a store-wide secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupKey([u8; KEY_LEN]);

impl BackupKey {
    /// Derive a key from an arbitrary-length secret.
    pub fn derive(secret: &[u8]) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, secret))
    }

    /// Use raw key bytes as-is.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(self.0.as_slice().into())
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BackupKey(..)")
    }
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
pub fn seal(
    key: &BackupKey,
    random: &dyn Random,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    random.fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CipherError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`seal`] with the same `aad`.
pub fn open(key: &BackupKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
    if sealed.len() < NONCE_LEN {
        return Err(CipherError::TooShort);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CipherError::OpenFailed)
}
