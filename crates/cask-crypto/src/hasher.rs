use cask_types::Hash;

/// Hashing capability consumed by the storage engine.
///
/// Implementations must be deterministic: identical input always yields the
/// identical [`Hash`].
pub trait Digest: Send + Sync {
    /// Hash raw bytes.
    fn digest(&self, data: &[u8]) -> Hash;
}

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag (e.g. `"cask-object-v1"`) that is
/// prepended to every hash computation, so hashes produced for one purpose
/// never collide with hashes computed elsewhere over the same bytes.
#[derive(Clone, Copy, Debug)]
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for stored objects (nodes and opaque records).
    pub const OBJECT: Self = Self {
        domain: "cask-object-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        Hash::from_digest(*hasher.finalize().as_bytes())
    }

    /// Verify that data produces the expected hash.
    pub fn verify(&self, data: &[u8], expected: &Hash) -> bool {
        self.hash(data) == *expected
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::OBJECT
    }
}

impl Digest for ContentHasher {
    fn digest(&self, data: &[u8]) -> Hash {
        self.hash(data)
    }
}
