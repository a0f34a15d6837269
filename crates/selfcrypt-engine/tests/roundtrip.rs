//! End-to-end write → flush → reopen → read behavior over shared stores.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use selfcrypt_core::{ContentHash, EngineConfig};
use selfcrypt_engine::{DataMap, SelfEncryptor};
use selfcrypt_store::{ChunkStore, DiskChunkStore, MemoryChunkStore};

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

/// Deterministic non-repeating test bytes.
fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761) % 256) as u8)
        .collect()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

#[test]
fn empty_write_yields_empty_map() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());

    enc.write(&[], 0).unwrap();
    let map = enc.close().unwrap();

    assert!(map.content.is_empty());
    assert!(map.chunks.is_empty());
    assert!(store.is_empty());
}

#[test]
fn tiny_file_stored_inline() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());

    enc.write(b"hello", 0).unwrap();
    let map = enc.close().unwrap();

    assert_eq!(map.content, b"hello");
    assert!(map.chunks.is_empty());
    assert!(store.is_empty(), "inline files must not produce chunks");
}

#[test]
fn exactly_three_chunks() {
    let store = Arc::new(MemoryChunkStore::new());
    let data = pattern(3 * CHUNK);
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&data, 0).unwrap();
    let map = enc.close().unwrap();

    assert_eq!(map.chunks.len(), 3);
    for (i, chunk) in map.chunks.iter().enumerate() {
        assert_eq!(chunk.size as usize, CHUNK);
        // pre-hash covers the chunk's plaintext...
        assert_eq!(
            chunk.pre_hash,
            ContentHash::compute(&data[i * CHUNK..(i + 1) * CHUNK])
        );
        // ...and the stored hash is the address of the exact ciphertext.
        let stored = store.get(&chunk.hash.unwrap()).unwrap().unwrap();
        assert_eq!(ContentHash::compute(&stored), chunk.hash.unwrap());
    }

    let mut reopened = encryptor(map, store);
    let mut out = vec![0u8; 3 * CHUNK];
    reopened.read(&mut out, 0).unwrap();
    assert_eq!(out, data);
}

#[test]
fn convergence_identical_input_identical_chunks() {
    let data = pattern(5 * CHUNK + 321);

    let store_a = Arc::new(MemoryChunkStore::new());
    let mut enc_a = encryptor(DataMap::new(), store_a.clone());
    enc_a.write(&data, 0).unwrap();
    let map_a = enc_a.close().unwrap();

    let store_b = Arc::new(MemoryChunkStore::new());
    let mut enc_b = encryptor(DataMap::new(), store_b.clone());
    enc_b.write(&data, 0).unwrap();
    let map_b = enc_b.close().unwrap();

    assert_eq!(map_a.chunks.len(), map_b.chunks.len());
    for (a, b) in map_a.chunks.iter().zip(map_b.chunks.iter()) {
        assert_eq!(a.pre_hash, b.pre_hash);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.size, b.size);
    }

    let mut addresses_a = store_a.addresses();
    let mut addresses_b = store_b.addresses();
    addresses_a.sort_by_key(|h| h.to_hex());
    addresses_b.sort_by_key(|h| h.to_hex());
    assert_eq!(addresses_a, addresses_b, "stores must converge");
}

#[test]
fn sparse_writes_with_zero_gaps() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());

    enc.write(&vec![b'A'; CHUNK], 10 * CHUNK as u64).unwrap();
    enc.write(&vec![b'B'; CHUNK], 0).unwrap();
    enc.write(&vec![b'C'; CHUNK], 5 * CHUNK as u64).unwrap();
    assert_eq!(enc.file_size(), 11 * CHUNK as u64);
    let map = enc.close().unwrap();

    let mut reopened = encryptor(map, store);
    assert_eq!(reopened.file_size(), 11 * CHUNK as u64);

    let mut out = vec![0u8; CHUNK];
    reopened.read(&mut out, 0).unwrap();
    assert_eq!(out, vec![b'B'; CHUNK]);
    reopened.read(&mut out, 5 * CHUNK as u64).unwrap();
    assert_eq!(out, vec![b'C'; CHUNK]);
    reopened.read(&mut out, 10 * CHUNK as u64).unwrap();
    assert_eq!(out, vec![b'A'; CHUNK]);

    // Never-written ranges read as zeros.
    reopened.read(&mut out, 3 * CHUNK as u64).unwrap();
    assert_eq!(out, vec![0u8; CHUNK]);
    reopened.read(&mut out, 8 * CHUNK as u64).unwrap();
    assert_eq!(out, vec![0u8; CHUNK]);
}

#[test]
fn random_access_reads() {
    let data = random_bytes(5 * CHUNK + 123, 7);
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&data, 0).unwrap();
    let map = enc.close().unwrap();

    let mut reopened = encryptor(map, store);
    let cases = [
        (0usize, 1usize),
        (10, 100),
        (CHUNK - 1, 2),
        (2 * CHUNK + 5, CHUNK),
        (5 * CHUNK, 123),
        (0, 5 * CHUNK + 123),
    ];
    for (offset, length) in cases {
        let mut out = vec![0u8; length];
        reopened.read(&mut out, offset as u64).unwrap();
        assert_eq!(
            out,
            &data[offset..offset + length],
            "mismatch at offset {offset} length {length}"
        );
    }
}

#[test]
fn flush_is_idempotent() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut enc = encryptor(DataMap::new(), store.clone());
    enc.write(&pattern(4 * CHUNK), 0).unwrap();

    enc.flush().unwrap();
    let hashes: Vec<_> = enc.data_map().chunks.iter().map(|c| c.hash).collect();
    let mut addresses = store.addresses();
    addresses.sort_by_key(|h| h.to_hex());

    enc.flush().unwrap();
    let hashes_again: Vec<_> = enc.data_map().chunks.iter().map(|c| c.hash).collect();
    let mut addresses_again = store.addresses();
    addresses_again.sort_by_key(|h| h.to_hex());

    assert_eq!(hashes, hashes_again);
    assert_eq!(addresses, addresses_again);
}

#[test]
fn disk_store_roundtrip_through_serialized_map() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DiskChunkStore::open(dir.path()).unwrap());
    let data = random_bytes(3 * CHUNK + 500, 11);

    let mut enc = SelfEncryptor::new(DataMap::new(), store.clone(), test_config()).unwrap();
    enc.write(&data, 0).unwrap();
    let map = enc.close().unwrap();

    // Persist the map and reopen everything from bytes.
    let wire = map.to_bytes().unwrap();
    let restored = DataMap::from_bytes(&wire).unwrap();

    let mut reopened = SelfEncryptor::new(restored, store, test_config()).unwrap();
    let mut out = vec![0u8; data.len()];
    reopened.read(&mut out, 0).unwrap();
    assert_eq!(out, data);
}
