//! In-memory chunk store, for tests and ephemeral pipelines.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use selfcrypt_core::{ContentHash, Result};

use crate::ChunkStore;

/// A `HashMap`-backed store guarded by a mutex.
#[derive(Default)]
pub struct MemoryChunkStore {
    blobs: Mutex<HashMap<ContentHash, Bytes>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of every stored chunk, in no particular order.
    pub fn addresses(&self) -> Vec<ContentHash> {
        self.blobs
            .lock()
            .expect("store mutex poisoned")
            .keys()
            .copied()
            .collect()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn get(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        Ok(self
            .blobs
            .lock()
            .expect("store mutex poisoned")
            .get(hash)
            .cloned())
    }

    fn put(&self, hash: &ContentHash, data: Bytes) -> Result<()> {
        self.blobs
            .lock()
            .expect("store mutex poisoned")
            .entry(*hash)
            .or_insert(data);
        Ok(())
    }

    fn delete(&self, hash: &ContentHash) -> Result<()> {
        self.blobs.lock().expect("store mutex poisoned").remove(hash);
        Ok(())
    }
}
