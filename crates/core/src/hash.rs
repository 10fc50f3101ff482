//! Content hash types and the blob path derivation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt;

/// Length of a content hash in bytes (SHA-512).
pub const CONTENT_HASH_LEN: usize = 64;

/// A SHA-512 content hash of canonicalized object bytes.
///
/// The hash is the sole key for physical storage: a given hash maps to at
/// most one stored blob, at the path returned by [`ContentHash::blob_path`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    /// Create a ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Compute the SHA-512 hash of a byte slice.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha512::new())
    }

    /// Parse from a lowercase hex string (128 characters).
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != CONTENT_HASH_LEN * 2 {
            return Err(crate::Error::InvalidHash(format!(
                "expected {} hex chars, got {}",
                CONTENT_HASH_LEN * 2,
                s.len()
            )));
        }
        let decoded = hex::decode(s).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        let mut bytes = [0u8; CONTENT_HASH_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Parse from a raw byte slice, which must be exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != CONTENT_HASH_LEN {
            return Err(crate::Error::InvalidHash(format!(
                "expected {} bytes, got {}",
                CONTENT_HASH_LEN,
                bytes.len()
            )));
        }
        let mut arr = [0u8; CONTENT_HASH_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the sharded backend path for this hash.
    ///
    /// The layout `blobs/{h0}/{h1h2h3}/{fullhex}` is a public contract:
    /// other systems construct these URLs, so it must not change without
    /// a migration.
    pub fn blob_path(&self) -> String {
        let hex = self.to_hex();
        format!("blobs/{}/{}/{}", &hex[..1], &hex[1..4], hex)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-512 hasher.
pub struct ContentHasher(Sha512);

impl ContentHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        ContentHash::hasher()
    }
}
