//! On-disk chunk store.
//!
//! Layout: `{root}/{hex[0..2]}/{hex}` (two-level sharding keeps directory
//! fan-out bounded). Writes go through a temp file and a rename so a crash
//! mid-write never leaves a truncated chunk at its final address.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use selfcrypt_core::{ContentHash, Result};

use crate::ChunkStore;

pub struct DiskChunkStore {
    root: PathBuf,
}

impl DiskChunkStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ChunkStore for DiskChunkStore {
    fn get(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        match fs::read(self.path_for(hash)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, hash: &ContentHash, data: Bytes) -> Result<()> {
        let path = self.path_for(hash);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, hash: &ContentHash) -> Result<()> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
