//! Chunk store integration tests: anonymous stores, dump, reload, and
//! corruption handling.

use super::*;
use crate::config::{OpenOptions, StorageKind};

fn build_sample_store() -> IndexStore {
    let store = IndexStore::create_memory(0);
    let vectors = store.alloc_chunk("hnsw.vectors", ChunkType::Vectors, 64).unwrap();
    vectors.write(0, &[0xAB; 64]).unwrap();
    let keys = store.alloc_chunk("hnsw.keys", ChunkType::Keys, 16).unwrap();
    keys.write(0, &7u64.to_le_bytes()).unwrap();
    keys.write(8, &9u64.to_le_bytes()).unwrap();
    store
}

#[test]
fn test_memory_store_alloc_and_get() {
    let store = build_sample_store();
    assert!(store.has_segment("hnsw.vectors"));
    assert_eq!(store.chunk_count("hnsw.vectors"), 1);

    let chunk = store.get_chunk("hnsw.keys", 0);
    let mut key = [0u8; 8];
    chunk.read(0, &mut key).unwrap();
    assert_eq!(u64::from_le_bytes(key), 7);
}

#[test]
fn test_directory_listing_preserves_order() {
    let store = build_sample_store();
    let listing = store.directory();
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0].name, "hnsw.vectors");
    assert_eq!(listing[0].length, 64);
    assert_eq!(listing[1].name, "hnsw.keys");
    assert_eq!(listing[1].type_tag, ChunkType::Keys);
}

#[test]
fn test_segment_grows_by_chunks() {
    let store = IndexStore::create_memory(0);
    store.alloc_chunk("seg", ChunkType::Blob, 8).unwrap();
    store.alloc_chunk("seg", ChunkType::Blob, 8).unwrap();
    assert_eq!(store.chunk_count("seg"), 2);
    assert_eq!(store.directory()[0].length, 16);
}

#[test]
fn test_type_tag_mismatch_rejected() {
    let store = IndexStore::create_memory(0);
    store.alloc_chunk("seg", ChunkType::Vectors, 8).unwrap();
    let err = store.alloc_chunk("seg", ChunkType::Keys, 8).unwrap_err();
    assert_eq!(err.code(), -1002);
}

#[test]
fn test_quota_refuses_past_limit() {
    let store = IndexStore::create_memory(100);
    store.alloc_chunk("a", ChunkType::Blob, 60).unwrap();
    let err = store.alloc_chunk("b", ChunkType::Blob, 60).unwrap_err();
    assert_eq!(err.code(), -1003);
    // Failed alloc must not leak reservation.
    store.alloc_chunk("c", ChunkType::Blob, 40).unwrap();
}

#[test]
fn test_dump_and_reload_mmap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.zvi");

    let store = build_sample_store();
    store.dump_to(&path).unwrap();

    let reloaded = IndexStore::open(&path, OpenOptions::read_only()).unwrap();
    assert!(reloaded.read_only());
    let chunk = reloaded.get_chunk("hnsw.vectors", 0);
    assert_eq!(chunk.len(), 64);
    let view = chunk.pin().unwrap();
    assert!(view.iter().all(|&b| b == 0xAB));

    let keys = reloaded.get_chunk("hnsw.keys", 0);
    let mut buf = [0u8; 8];
    keys.read(8, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 9);
}

#[test]
fn test_reload_into_memory_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.zvi");
    build_sample_store().dump_to(&path).unwrap();

    let options = OpenOptions {
        storage: StorageKind::Memory,
        verify_checksums: true,
        ..OpenOptions::default()
    };
    let reloaded = IndexStore::open(&path, options).unwrap();
    let chunk = reloaded.get_chunk("hnsw.vectors", 0);
    let view = chunk.pin().unwrap();
    assert_eq!(view.len(), 64);
}

#[test]
fn test_read_only_chunk_rejects_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.zvi");
    build_sample_store().dump_to(&path).unwrap();

    let reloaded = IndexStore::open(&path, OpenOptions::read_only()).unwrap();
    let chunk = reloaded.get_chunk("hnsw.keys", 0);
    let err = chunk.write(0, &[0; 8]).unwrap_err();
    assert_eq!(err.code(), -1005);
}

#[test]
fn test_writable_reload_allows_tombstone_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.zvi");
    build_sample_store().dump_to(&path).unwrap();

    let options = OpenOptions {
        read_only: false,
        verify_checksums: true,
        ..OpenOptions::default()
    };
    let reloaded = IndexStore::open(&path, options).unwrap();
    let chunk = reloaded.get_chunk("hnsw.keys", 0);
    chunk.write(0, &0u64.to_le_bytes()).unwrap();
    reloaded.flush().unwrap();

    let mut buf = [0u8; 8];
    reloaded.get_chunk("hnsw.keys", 0).read(0, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 0);
}

#[test]
fn test_corrupted_segment_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.zvi");
    build_sample_store().dump_to(&path).unwrap();

    // Flip one byte inside the first segment.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[10] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let err = IndexStore::open(&path, OpenOptions::read_only()).unwrap_err();
    assert_eq!(err.code(), -1006);
}

#[test]
fn test_truncated_container_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.zvi");
    std::fs::write(&path, b"short").unwrap();
    let err = IndexStore::open(&path, OpenOptions::read_only()).unwrap_err();
    assert_eq!(err.code(), -1006);
}

#[test]
fn test_alloc_rejected_on_mapped_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.zvi");
    build_sample_store().dump_to(&path).unwrap();

    let reloaded = IndexStore::open(&path, OpenOptions::read_only()).unwrap();
    let err = reloaded.alloc_chunk("new", ChunkType::Blob, 8).unwrap_err();
    assert_eq!(err.code(), -1005);
}
