//! selfcrypt-store: content-addressed blob storage for encrypted chunks.
//!
//! A chunk's address is the SHA-512 of its ciphertext, so the value stored
//! under a key is fully determined by the key: `put` on an existing address
//! is a no-op, and two writers racing on the same address are storing the
//! same bytes.

pub mod disk;
pub mod memory;

use bytes::Bytes;
use selfcrypt_core::{ContentHash, Result};

pub use disk::DiskChunkStore;
pub use memory::MemoryChunkStore;

/// Content-addressed blob storage.
///
/// All methods take `&self` so a single store can be shared across threads;
/// implementations use interior mutability to protect their bookkeeping.
/// Concurrent calls on distinct addresses must be safe — the engine
/// serializes competing put/delete on the same address itself.
pub trait ChunkStore: Send + Sync {
    /// Fetch the ciphertext stored under `hash`, or `None` if absent.
    fn get(&self, hash: &ContentHash) -> Result<Option<Bytes>>;

    /// Store `data` under `hash`. A no-op if the address already exists.
    fn put(&self, hash: &ContentHash, data: Bytes) -> Result<()>;

    /// Remove the blob stored under `hash`. Removing an absent address is
    /// not an error.
    fn delete(&self, hash: &ContentHash) -> Result<()>;
}
