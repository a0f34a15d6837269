//! selfcrypt-crypto: the convergent chunk cipher
//!
//! Pipeline (per chunk): plaintext → gzip → AES-256-CFB → XOR pad → ciphertext
//!
//! Keying is convergent — every parameter is derived from SHA-512 pre-hashes
//! of chunk plaintext, never from randomness:
//! ```text
//! key = pre_hash[n-2][0..32]
//! iv  = pre_hash[n-2][32..48]
//! pad = pre_hash[n-1] || pre_hash[n] || pre_hash[n-2][48..64]   (144 bytes)
//! ```
//! where `n-1`/`n-2` are the chunk's two predecessors modulo the chunk count.
//! Identical plaintext therefore yields identical ciphertext, which is what
//! makes cross-user deduplication of stored chunks possible.

pub mod codec;
pub mod keys;

pub use codec::{open, seal};
pub use keys::ChunkKeys;

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// AES block / IV length in bytes.
pub const IV_SIZE: usize = 16;

/// XOR pad length: three SHA-512 digests minus the key and IV material.
pub const PAD_SIZE: usize = 3 * selfcrypt_core::HASH_SIZE - KEY_SIZE - IV_SIZE;
