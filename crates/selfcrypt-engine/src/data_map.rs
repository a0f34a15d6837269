//! The serializable descriptor of an encrypted file.
//!
//! A `DataMap` is the only persistent pointer from a file to its bytes in
//! the store: either the raw content inline (files smaller than three
//! minimum chunks) or an ordered list of [`ChunkDetails`], one per stored
//! chunk.

use selfcrypt_core::{ContentHash, Error, Result};
use serde::{Deserialize, Serialize};

/// Per-chunk bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDetails {
    /// SHA-512 of the chunk's plaintext at its normal size.
    pub pre_hash: ContentHash,
    /// SHA-512 of the stored ciphertext; the chunk's address in the store.
    /// `None` until the chunk has been encrypted at least once.
    pub hash: Option<ContentHash>,
    /// Pre-compression plaintext length.
    pub size: u32,
    /// Snapshot of the predecessors' pre-hashes as they were before an
    /// in-progress rewrite, kept so this chunk's still-on-disk ciphertext
    /// stays decryptable until it is re-encrypted itself. Never persisted:
    /// a successful flush re-encrypts every dependent and clears these.
    #[serde(skip)]
    pub old_n1_pre_hash: Option<ContentHash>,
    #[serde(skip)]
    pub old_n2_pre_hash: Option<ContentHash>,
}

impl ChunkDetails {
    /// A slot awaiting its first pre-hash and encryption.
    pub fn placeholder() -> Self {
        Self {
            pre_hash: ContentHash::from_bytes([0u8; selfcrypt_core::HASH_SIZE]),
            hash: None,
            size: 0,
            old_n1_pre_hash: None,
            old_n2_pre_hash: None,
        }
    }
}

/// Descriptor of one encrypted file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataMap {
    /// Inline plaintext, used only when the file is smaller than three
    /// minimum chunks (in which case `chunks` is empty).
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
    /// Ordered chunk descriptors; empty, or at least three entries.
    pub chunks: Vec<ChunkDetails>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical size of the file this map describes.
    ///
    /// Every chunk except the last has the normal size (the first chunk's
    /// recorded size), so the total is `(n-1) * normal + last`.
    pub fn file_size(&self) -> u64 {
        if !self.content.is_empty() {
            return self.content.len() as u64;
        }
        match (self.chunks.first(), self.chunks.last()) {
            (Some(first), Some(last)) => {
                (self.chunks.len() as u64 - 1) * u64::from(first.size) + u64::from(last.size)
            }
            _ => 0,
        }
    }

    pub fn is_inline(&self) -> bool {
        !self.content.is_empty()
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::DataMap(format!("serialize: {e}")))
    }

    /// Deserialize from JSON bytes, enforcing the shape invariant.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let map: DataMap =
            serde_json::from_slice(data).map_err(|e| Error::DataMap(format!("deserialize: {e}")))?;
        map.validate()?;
        Ok(map)
    }

    /// Either inline content with no chunks, or no content with zero or at
    /// least three chunks.
    pub fn validate(&self) -> Result<()> {
        if !self.content.is_empty() && !self.chunks.is_empty() {
            return Err(Error::DataMap(
                "map has both inline content and chunks".into(),
            ));
        }
        if !self.chunks.is_empty() && self.chunks.len() < 3 {
            return Err(Error::DataMap(format!(
                "map has {} chunks; chunked files need at least 3",
                self.chunks.len()
            )));
        }
        Ok(())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
