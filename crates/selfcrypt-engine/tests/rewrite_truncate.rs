//! Rewrite and truncate behavior: neighbour-keyed re-encryption, snapshot
//! bookkeeping across sessions, and prefix-preserving truncation.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use selfcrypt_core::{EngineConfig, Error};
use selfcrypt_engine::{DataMap, SelfEncryptor};
use selfcrypt_store::{ChunkStore, MemoryChunkStore};

const CHUNK: usize = 1024;

fn test_config() -> EngineConfig {
    EngineConfig {
        chunk_size: CHUNK as u32,
        min_chunk_size: 64,
        workers: 2,
        compression: 6,
    }
}

fn encryptor(map: DataMap, store: Arc<MemoryChunkStore>) -> SelfEncryptor {
    SelfEncryptor::new(map, store, test_config()).unwrap()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

#[test]
fn rewrite_middle_chunk_changes_dependent_hashes() {
    // Per-chunk-distinct data: identical chunks would converge to a single
    // stored address and hide the per-chunk bookkeeping.
    let data = random_bytes(5 * CHUNK, 17);
    let patch = random_bytes(CHUNK, 18);

    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&data, 0).unwrap();
    enc.flush().unwrap();

    let before: Vec<_> = enc.data_map().chunks.iter().map(|c| c.hash.unwrap()).collect();
    assert_eq!(before.len(), 5);
    assert_eq!(store.len(), 5);

    enc.write(&patch, 2 * CHUNK as u64).unwrap();
    let map = enc.close().unwrap();

    let after: Vec<_> = map.chunks.iter().map(|c| c.hash.unwrap()).collect();
    // The rewritten chunk changes, and so do the two chunks keyed off it.
    assert_ne!(after[2], before[2]);
    assert_ne!(after[3], before[3]);
    assert_ne!(after[4], before[4]);

    // Snapshots are an in-session mechanism only.
    for chunk in &map.chunks {
        assert!(chunk.old_n1_pre_hash.is_none());
        assert!(chunk.old_n2_pre_hash.is_none());
    }

    // No orphaned ciphertexts: one stored blob per chunk.
    assert_eq!(store.len(), 5);
    for chunk in &map.chunks {
        assert!(store.get(&chunk.hash.unwrap()).unwrap().is_some());
    }

    let mut reopened = encryptor(map, store);
    let mut out = vec![0u8; 5 * CHUNK];
    reopened.read(&mut out, 0).unwrap();
    let mut expected = data;
    expected[2 * CHUNK..3 * CHUNK].copy_from_slice(&patch);
    assert_eq!(out, expected);
}

#[test]
fn rewrite_preserves_unmodified_ranges() {
    let data = random_bytes(6 * CHUNK, 3);
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&data, 0).unwrap();
    enc.flush().unwrap();

    let patch = random_bytes(100, 4);
    let patch_at = 3 * CHUNK as u64 + 50;
    enc.write(&patch, patch_at).unwrap();
    let map = enc.close().unwrap();

    let mut expected = data;
    expected[patch_at as usize..patch_at as usize + patch.len()].copy_from_slice(&patch);

    let mut reopened = encryptor(map, store);
    let mut out = vec![0u8; expected.len()];
    reopened.read(&mut out, 0).unwrap();
    assert_eq!(out, expected);
}

#[test]
fn extend_existing_file_across_sessions() {
    let first = random_bytes(4 * CHUNK, 21);
    let second = random_bytes(2 * CHUNK, 22);

    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&first, 0).unwrap();
    let map = enc.close().unwrap();

    let mut enc = encryptor(map, store.clone());
    enc.write(&second, 4 * CHUNK as u64).unwrap();
    let map = enc.close().unwrap();
    assert_eq!(map.chunks.len(), 6);

    let mut reopened = encryptor(map, store);
    let mut out = vec![0u8; 6 * CHUNK];
    reopened.read(&mut out, 0).unwrap();
    assert_eq!(&out[..4 * CHUNK], &first[..]);
    assert_eq!(&out[4 * CHUNK..], &second[..]);
}

#[test]
fn truncate_mid_chunk_preserves_prefix() {
    let data = random_bytes(10 * CHUNK, 51);
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&data, 0).unwrap();
    enc.flush().unwrap();
    assert_eq!(store.len(), 10);

    let new_size = 3 * CHUNK as u64 + 100;
    enc.truncate(new_size).unwrap();
    assert_eq!(enc.file_size(), new_size);
    let map = enc.close().unwrap();

    assert_eq!(map.chunks.len(), 4);
    assert_eq!(map.chunks.last().unwrap().size, 100);
    // Nothing beyond the new tail survives in the store.
    assert_eq!(store.len(), 4);

    let mut reopened = encryptor(map, store);
    assert_eq!(reopened.file_size(), new_size);
    let mut out = vec![0u8; new_size as usize];
    reopened.read(&mut out, 0).unwrap();
    assert_eq!(out, &data[..new_size as usize]);
}

#[test]
fn truncate_to_tiny_goes_inline() {
    let data = random_bytes(5 * CHUNK, 31);
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&data, 0).unwrap();
    enc.flush().unwrap();

    enc.truncate(100).unwrap();
    let map = enc.close().unwrap();

    assert_eq!(map.content, &data[..100]);
    assert!(map.chunks.is_empty());
    assert!(store.is_empty(), "all chunks must be deleted");
}

#[test]
fn truncate_to_zero_empties_everything() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&random_bytes(4 * CHUNK, 61), 0).unwrap();
    enc.flush().unwrap();

    enc.truncate(0).unwrap();
    assert_eq!(enc.file_size(), 0);
    let map = enc.close().unwrap();

    assert!(map.content.is_empty());
    assert!(map.chunks.is_empty());
    assert!(store.is_empty());
}

#[test]
fn truncate_never_grows() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(b"short", 0).unwrap();

    enc.truncate(10_000).unwrap();
    assert_eq!(enc.file_size(), 5);
}

#[test]
fn missing_chunk_surfaces_as_error() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&random_bytes(3 * CHUNK, 41), 0).unwrap();
    let map = enc.close().unwrap();

    // Simulate store corruption / concurrent deletion.
    store.delete(&map.chunks[0].hash.unwrap()).unwrap();

    let mut reopened = encryptor(map, store);
    let mut out = vec![0u8; CHUNK];
    let err = reopened.read(&mut out, 0).unwrap_err();
    assert!(matches!(err, Error::MissingChunk(_)));
}
