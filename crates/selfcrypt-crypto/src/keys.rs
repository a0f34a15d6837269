//! Deterministic derivation of a chunk's cipher parameters from the SHA-512
//! pre-hashes of the chunk itself and its two predecessors.

use selfcrypt_core::{ContentHash, HASH_SIZE};

use crate::{IV_SIZE, KEY_SIZE, PAD_SIZE};

/// Cipher parameters for one chunk.
pub struct ChunkKeys {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    pad: [u8; PAD_SIZE],
}

impl ChunkKeys {
    /// Derive key, IV and pad for a chunk from `this` (its own pre-hash) and
    /// the pre-hashes of its two predecessors `n1` (n-1) and `n2` (n-2).
    pub fn derive(this: &ContentHash, n1: &ContentHash, n2: &ContentHash) -> Self {
        let n1 = n1.as_bytes();
        let n2 = n2.as_bytes();

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&n2[..KEY_SIZE]);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&n2[KEY_SIZE..KEY_SIZE + IV_SIZE]);

        // pad = n1 || this || remainder of n2
        let mut pad = [0u8; PAD_SIZE];
        pad[..HASH_SIZE].copy_from_slice(n1);
        pad[HASH_SIZE..2 * HASH_SIZE].copy_from_slice(this.as_bytes());
        pad[2 * HASH_SIZE..].copy_from_slice(&n2[KEY_SIZE + IV_SIZE..]);

        Self { key, iv, pad }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn pad(&self) -> &[u8; PAD_SIZE] {
        &self.pad
    }
}

impl std::fmt::Debug for ChunkKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkKeys").finish_non_exhaustive()
    }
}
